// Vulkan instance and presentation surface
//
// The instance is shared through an Arc so that every object created from it
// (surface, logical device) keeps it alive and it is destroyed last.

use ash::{vk, Entry};
use raw_window_handle::{HasRawDisplayHandle, HasRawWindowHandle, RawDisplayHandle};
use std::ffi::{c_char, CStr, CString};
use std::sync::Arc;

use crate::error::{GraphicsError, Result};

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

pub struct Instance {
    pub instance: ash::Instance,
    pub surface_loader: ash::extensions::khr::Surface,
    debug_utils: Option<(ash::extensions::ext::DebugUtils, vk::DebugUtilsMessengerEXT)>,
    // Keeps the loader library mapped for as long as the instance lives.
    pub entry: Entry,
}

impl Instance {
    /// Create a Vulkan instance.
    ///
    /// # Arguments
    /// * `app_name` - Application name reported to the driver
    /// * `enable_validation` - Enable the Khronos validation layer and route its
    ///   messages to `log`
    /// * `display` - Display the surface will be created on; selects the
    ///   platform surface extensions
    pub fn new(
        app_name: &str,
        enable_validation: bool,
        display: Option<RawDisplayHandle>,
    ) -> Result<Arc<Self>> {
        log::info!("Creating Vulkan instance: {}", app_name);

        let entry = unsafe { Entry::load() }
            .map_err(|e| GraphicsError::LoadingLibrary(e.to_string()))?;

        let enable_validation = enable_validation && Self::validation_layer_present(&entry);

        let app_name_cstr = CString::new(app_name)
            .map_err(|_| GraphicsError::CreatingInstance(vk::Result::ERROR_INITIALIZATION_FAILED))?;

        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name_cstr)
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(c"vk-frames")
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(vk::API_VERSION_1_2);

        let mut extensions: Vec<*const c_char> = Vec::new();
        if let Some(display) = display {
            let required = ash_window::enumerate_required_extensions(display)
                .map_err(GraphicsError::CreatingInstance)?;
            extensions.extend_from_slice(required);
        }
        if enable_validation {
            extensions.push(ash::extensions::ext::DebugUtils::name().as_ptr());
        }

        let layer_names = if enable_validation {
            vec![VALIDATION_LAYER.as_ptr()]
        } else {
            vec![]
        };

        let create_info = vk::InstanceCreateInfo::builder()
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layer_names);

        let instance = unsafe { entry.create_instance(&create_info, None) }
            .map_err(GraphicsError::CreatingInstance)?;

        let debug_utils = if enable_validation {
            match Self::setup_debug_messenger(&entry, &instance) {
                Ok(messenger) => Some(messenger),
                Err(e) => {
                    unsafe { instance.destroy_instance(None) };
                    return Err(e);
                }
            }
        } else {
            None
        };

        let surface_loader = ash::extensions::khr::Surface::new(&entry, &instance);

        Ok(Arc::new(Self {
            instance,
            surface_loader,
            debug_utils,
            entry,
        }))
    }

    fn validation_layer_present(entry: &Entry) -> bool {
        let layers = match entry.enumerate_instance_layer_properties() {
            Ok(layers) => layers,
            Err(e) => {
                log::warn!("Could not enumerate instance layers: {}", e);
                return false;
            }
        };
        let found = layers.iter().any(|layer| {
            let name = unsafe { CStr::from_ptr(layer.layer_name.as_ptr()) };
            name == VALIDATION_LAYER
        });
        if !found {
            log::warn!("Validation requested but VK_LAYER_KHRONOS_validation is not installed");
        }
        found
    }

    fn setup_debug_messenger(
        entry: &Entry,
        instance: &ash::Instance,
    ) -> Result<(ash::extensions::ext::DebugUtils, vk::DebugUtilsMessengerEXT)> {
        let debug_utils = ash::extensions::ext::DebugUtils::new(entry, instance);

        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::INFO
                    | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(debug_callback));

        let messenger = unsafe { debug_utils.create_debug_utils_messenger(&create_info, None) }
            .map_err(GraphicsError::CreatingDebugMessenger)?;

        Ok((debug_utils, messenger))
    }

    pub fn validation_enabled(&self) -> bool {
        self.debug_utils.is_some()
    }
}

impl Drop for Instance {
    fn drop(&mut self) {
        log::info!("Destroying Vulkan instance");
        unsafe {
            if let Some((debug_utils, messenger)) = self.debug_utils.take() {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }
            self.instance.destroy_instance(None);
        }
    }
}

/// A presentation surface. Created by the window layer and handed to the
/// device selector and swapchain, which never look it up on their own.
pub struct Surface {
    instance: Arc<Instance>,
    pub surface: vk::SurfaceKHR,
}

impl Surface {
    pub fn from_window<W>(instance: &Arc<Instance>, window: &W) -> Result<Self>
    where
        W: HasRawWindowHandle + HasRawDisplayHandle,
    {
        let surface = unsafe {
            ash_window::create_surface(
                &instance.entry,
                &instance.instance,
                window.raw_display_handle(),
                window.raw_window_handle(),
                None,
            )
        }
        .map_err(GraphicsError::CreatingSurface)?;

        Ok(Self::from_raw(instance, surface))
    }

    /// Adopts a surface created elsewhere from `instance`.
    pub fn from_raw(instance: &Arc<Instance>, surface: vk::SurfaceKHR) -> Self {
        Self {
            instance: instance.clone(),
            surface,
        }
    }

    pub fn instance(&self) -> &Arc<Instance> {
        &self.instance
    }

    pub fn loader(&self) -> &ash::extensions::khr::Surface {
        &self.instance.surface_loader
    }
}

impl Drop for Surface {
    fn drop(&mut self) {
        unsafe { self.instance.surface_loader.destroy_surface(self.surface, None) };
    }
}

// Debug callback for validation layers
unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _p_user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    if p_callback_data.is_null() || (*p_callback_data).p_message.is_null() {
        return vk::FALSE;
    }
    let message = CStr::from_ptr((*p_callback_data).p_message).to_string_lossy();

    match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => log::error!("[Vulkan] {}", message),
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => log::warn!("[Vulkan] {}", message),
        vk::DebugUtilsMessageSeverityFlagsEXT::INFO => log::debug!("[Vulkan] {}", message),
        _ => log::trace!("[Vulkan] {}", message),
    }

    vk::FALSE
}
