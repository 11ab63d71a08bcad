// =============================================================================
// VK-FRAMES DEMO
// =============================================================================
//
// Drives the frame synchronizer from a winit window.
//
// FRAME FLOW:
// 1. begin_frame   (wait for the slot, acquire an image)
// 2. per batch: begin_batch -> bind -> draw -> end_batch
// 3. end_frame     (fence the slot)
// 4. present
//
// With `demo.vertex_shader` and `demo.fragment_shader` set in config.toml
// the demo draws two textured quads, one batch each. Without them it only
// clears the screen.
//
// =============================================================================

use anyhow::{Context, Result};
use ash::vk;
use glam::{Mat4, Vec2};
use raw_window_handle::HasRawDisplayHandle;
use std::fs::File;
use std::sync::Arc;
use std::time::Instant;
use winit::{
    application::ApplicationHandler,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, EventLoop},
    window::{Window, WindowAttributes},
};

use vk_frames::backend::{
    AllocatedBuffer, FrameInfo, FrameSynchronizer, GraphicsContext, Instance, PipelineDesc,
    PipelineId, PixelLayout, ShaderStage, Surface, TextureId,
};
use vk_frames::{Config, ErrorClass};

// =============================================================================
// ENTRY POINT
// =============================================================================

fn main() -> Result<()> {
    let config = Config::load();

    init_logging(&config)?;
    log::info!("Starting vk-frames demo");
    log::info!(
        "Window: {}x{}, {} frames in flight",
        config.window.width,
        config.window.height,
        config.graphics.frames_in_flight
    );
    log::info!("Present mode: {}", config.graphics.present_mode);

    let event_loop = EventLoop::new()?;
    let mut app = App::new(config);
    event_loop.run_app(&mut app)?;
    Ok(())
}

/// Initialize logging, optionally sending everything to a file
fn init_logging(config: &Config) -> Result<()> {
    use env_logger::{Builder, Target};
    use log::LevelFilter;

    let level = config
        .debug
        .log_level
        .parse::<LevelFilter>()
        .unwrap_or(LevelFilter::Info);

    let mut builder = Builder::from_default_env();
    builder.filter_level(level);

    if config.debug.log_to_file {
        let file = File::create(&config.debug.log_file)
            .with_context(|| format!("Failed to create log file {}", config.debug.log_file))?;
        builder.target(Target::Pipe(Box::new(file)));
    }

    builder.init();
    Ok(())
}

// =============================================================================
// SCENE
// =============================================================================

/// Interleaved position + uv
const QUAD_VERTICES: [[f32; 4]; 4] = [
    [-0.5, -0.5, 0.0, 0.0],
    [0.5, -0.5, 1.0, 0.0],
    [0.5, 0.5, 1.0, 1.0],
    [-0.5, 0.5, 0.0, 1.0],
];
const QUAD_INDICES: [u16; 6] = [0, 1, 2, 2, 3, 0];

/// offset (vec2), texture slot, time
const PUSH_CONSTANT_BYTES: u32 = 16;

fn f32_bytes(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|value| value.to_ne_bytes()).collect()
}

fn checkerboard(size: u32) -> Vec<u8> {
    (0..size * size)
        .flat_map(|i| {
            let (x, y) = (i % size, i / size);
            if (x + y) % 2 == 0 {
                [230, 230, 230]
            } else {
                [40, 40, 60]
            }
        })
        .collect()
}

fn gradient(size: u32) -> Vec<u8> {
    (0..size * size)
        .flat_map(|i| {
            let (x, y) = (i % size, i / size);
            let r = (x * 255 / (size - 1)) as u8;
            let g = (y * 255 / (size - 1)) as u8;
            [r, g, 160, 255]
        })
        .collect()
}

struct Scene {
    pipeline: PipelineId,
    textures: [TextureId; 2],
    vertices: AllocatedBuffer,
    indices: AllocatedBuffer,
    started: Instant,
}

impl Scene {
    fn load(
        context: &GraphicsContext,
        frames: &mut FrameSynchronizer,
        vertex_path: &str,
        fragment_path: &str,
    ) -> Result<Self> {
        let vertex_spirv = std::fs::read(vertex_path)
            .with_context(|| format!("Failed to read vertex shader {}", vertex_path))?;
        let fragment_spirv = std::fs::read(fragment_path)
            .with_context(|| format!("Failed to read fragment shader {}", fragment_path))?;

        let desc = PipelineDesc::new(vec![
            ShaderStage::new(vk::ShaderStageFlags::VERTEX, vertex_spirv),
            ShaderStage::new(vk::ShaderStageFlags::FRAGMENT, fragment_spirv),
        ])
        .with_vertex_input(
            vec![vk::VertexInputBindingDescription {
                binding: 0,
                stride: std::mem::size_of::<[f32; 4]>() as u32,
                input_rate: vk::VertexInputRate::VERTEX,
            }],
            vec![
                vk::VertexInputAttributeDescription {
                    location: 0,
                    binding: 0,
                    format: vk::Format::R32G32_SFLOAT,
                    offset: 0,
                },
                vk::VertexInputAttributeDescription {
                    location: 1,
                    binding: 0,
                    format: vk::Format::R32G32_SFLOAT,
                    offset: 8,
                },
            ],
        )
        .with_push_constants(PUSH_CONSTANT_BYTES);
        let pipeline = frames.push_pipeline(&desc)?;

        let bindings = frames.bindings_mut();
        bindings.register_uniform(std::mem::size_of::<Mat4>() as u64)?;

        let checker = bindings.register_texture()?;
        bindings.set_texture_data(checker, 8, 8, PixelLayout::Rgb8, &checkerboard(8))?;
        let fade = bindings.register_texture()?;
        bindings.set_texture_data(fade, 16, 16, PixelLayout::Rgba8, &gradient(16))?;

        let device = context.device();
        let vertices = AllocatedBuffer::with_data(
            device,
            vk::BufferUsageFlags::VERTEX_BUFFER,
            &QUAD_VERTICES,
            "quad vertices",
        )?;
        let indices = AllocatedBuffer::with_data(
            device,
            vk::BufferUsageFlags::INDEX_BUFFER,
            &QUAD_INDICES,
            "quad indices",
        )?;

        log::info!("Demo scene loaded");
        Ok(Self {
            pipeline,
            textures: [checker, fade],
            vertices,
            indices,
            started: Instant::now(),
        })
    }

    /// One batch per texture so the second batch loads what the first drew.
    fn record(&self, frames: &mut FrameSynchronizer, frame: &FrameInfo) -> vk_frames::Result<()> {
        let aspect = frame.extent.width as f32 / frame.extent.height.max(1) as f32;
        let projection = Mat4::orthographic_rh(-aspect, aspect, -1.0, 1.0, -1.0, 1.0);
        frames
            .bindings_mut()
            .set_uniform_data(&f32_bytes(&projection.to_cols_array()))?;

        let time = self.started.elapsed().as_secs_f32();
        let offsets = [Vec2::new(-0.6, 0.0), Vec2::new(0.6, 0.0)];

        for (&texture, offset) in self.textures.iter().zip(offsets) {
            let bindings = frames.bindings_mut();
            bindings.reset_texture_bind();
            let Some(slot) = bindings.texture_bind(texture)? else {
                log::warn!("Texture array full, skipping batch");
                continue;
            };

            frames.begin_batch()?;
            frames.bind_pipeline(self.pipeline)?;
            frames.bind_vertex_buffer(&self.vertices)?;
            frames.bind_index_buffer(&self.indices, vk::IndexType::UINT16)?;
            frames.push_constants(&f32_bytes(&[offset.x, offset.y, slot as f32, time]))?;
            frames.draw_indexed(QUAD_INDICES.len() as u32)?;
            frames.end_batch()?;
        }
        Ok(())
    }
}

// =============================================================================
// APPLICATION STATE
// =============================================================================

/// Drop waits for the GPU first; after that field order does not matter,
/// except that the window must outlive the surface held by `context`.
pub struct App {
    config: Config,

    frames: Option<FrameSynchronizer>,
    scene: Option<Scene>,
    context: Option<GraphicsContext>,
    window: Option<Arc<Window>>,

    /// Set when window is minimized (size = 0) - skip rendering
    is_minimized: bool,

    frame_count: u32,
    last_fps_update: Instant,
}

impl App {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            frames: None,
            scene: None,
            context: None,
            window: None,
            is_minimized: false,
            frame_count: 0,
            last_fps_update: Instant::now(),
        }
    }

    // =========================================================================
    // INITIALIZATION
    // =========================================================================

    fn init_graphics(&mut self, window: &Window) -> Result<()> {
        let instance = Instance::new(
            &self.config.window.title,
            self.config.debug.validation_layers,
            Some(window.raw_display_handle()),
        )?;

        let surface = Surface::from_window(&instance, window)?;
        let context = GraphicsContext::new(&instance, surface, &self.config.graphics)?;

        let size = window.inner_size();
        let mut frames = FrameSynchronizer::new(
            &context,
            &self.config.graphics,
            vk::Extent2D {
                width: size.width,
                height: size.height,
            },
        )?;

        let scene = match (&self.config.demo.vertex_shader, &self.config.demo.fragment_shader) {
            (Some(vertex), Some(fragment)) => {
                Some(Scene::load(&context, &mut frames, vertex, fragment)?)
            }
            _ => {
                log::info!("No demo shaders configured, clearing only");
                None
            }
        };

        self.scene = scene;
        self.frames = Some(frames);
        self.context = Some(context);
        Ok(())
    }

    // =========================================================================
    // RENDERING
    // =========================================================================

    /// Returns whether a frame was presented.
    fn render_frame(&mut self) -> vk_frames::Result<bool> {
        if self.is_minimized {
            return Ok(false);
        }
        let Some(frames) = self.frames.as_mut() else {
            return Ok(false);
        };

        let Some(frame) = frames.begin_frame()? else {
            return Ok(false);
        };
        if let Some(scene) = &self.scene {
            scene.record(frames, &frame)?;
        }
        frames.end_frame()?;
        frames.present()?;
        Ok(true)
    }

    fn update_fps(&mut self) {
        self.frame_count += 1;

        let now = Instant::now();
        let elapsed = now.duration_since(self.last_fps_update).as_secs_f32();
        if elapsed < 1.0 {
            return;
        }

        let fps = self.frame_count as f32 / elapsed;
        if let Some(ref window) = self.window {
            window.set_title(&format!("{} - {:.0} FPS", self.config.window.title, fps));
        }
        self.frame_count = 0;
        self.last_fps_update = now;
    }
}

// =============================================================================
// EVENT HANDLING
// =============================================================================

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }

        let window_attributes = WindowAttributes::default()
            .with_title(&self.config.window.title)
            .with_inner_size(winit::dpi::PhysicalSize::new(
                self.config.window.width,
                self.config.window.height,
            ));

        let window = match event_loop.create_window(window_attributes) {
            Ok(w) => Arc::new(w),
            Err(e) => {
                log::error!("Failed to create window: {:?}", e);
                event_loop.exit();
                return;
            }
        };

        if let Err(e) = self.init_graphics(&window) {
            log::error!("Failed to initialize graphics: {:#}", e);
            event_loop.exit();
            return;
        }

        self.window = Some(window);
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        _id: winit::window::WindowId,
        event: WindowEvent,
    ) {
        match event {
            WindowEvent::CloseRequested => {
                log::info!("Close requested, shutting down...");
                event_loop.exit();
            }

            WindowEvent::Resized(size) => {
                log::debug!("Window resized to {}x{}", size.width, size.height);
                self.is_minimized = size.width == 0 || size.height == 0;
                if let Some(frames) = self.frames.as_mut() {
                    frames.notify_resize(size.width, size.height);
                }
            }

            WindowEvent::RedrawRequested => match self.render_frame() {
                Ok(true) => self.update_fps(),
                Ok(false) => {}
                Err(e) => match e.class() {
                    ErrorClass::Recoverable => log::debug!("Frame skipped: {}", e),
                    ErrorClass::SetupFatal | ErrorClass::SubmissionFatal => {
                        log::error!("Render error: {}", e);
                        event_loop.exit();
                    }
                },
            },

            WindowEvent::KeyboardInput { event, .. } => {
                use winit::keyboard::{KeyCode, PhysicalKey};

                if event.state.is_pressed()
                    && event.physical_key == PhysicalKey::Code(KeyCode::Escape)
                {
                    log::info!("ESC pressed, exiting...");
                    event_loop.exit();
                }
            }

            _ => {}
        }
    }

    /// Request continuous redraws.
    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(ref window) = self.window {
            window.request_redraw();
        }
    }
}

// =============================================================================
// CLEANUP
// =============================================================================

impl Drop for App {
    fn drop(&mut self) {
        log::info!("Cleaning up...");

        if let Some(ref context) = self.context {
            if let Err(e) = context.device().wait_idle() {
                log::warn!("wait_idle during shutdown failed: {}", e);
            }
        }
    }
}
