// Resource binding table
//
// Layout of every frame descriptor set:
//   binding 0: uniform buffer (vertex stage)
//   binding 1: combined image sampler array[MAX_BOUND_TEXTURES] (fragment stage)
//
// Each frame slot owns one set per batch, so a batch recorded later in the
// frame never rewrites a set an earlier, already submitted batch reads.
// Pools are sized once from config and never grow.

use ash::vk;
use ash::vk::Handle;
use slotmap::SlotMap;
use std::sync::Arc;

use super::buffer::AllocatedBuffer;
use super::handle::{Owned, OwnedDescriptorPool, OwnedDescriptorSet, OwnedDescriptorSetLayout};
use super::texture::{PixelLayout, TextureImage};
use super::LogicalDevice;
use crate::config::GraphicsConfig;
use crate::error::{GraphicsError, Result};

pub const MAX_BOUND_TEXTURES: u32 = 32;

const UNIFORM_BINDING: u32 = 0;
const TEXTURE_ARRAY_BINDING: u32 = 1;

slotmap::new_key_type! {
    /// Handle of a registered texture. Stays invalid after unregistration even
    /// if the slot is reused.
    pub struct TextureId;
}

/// Set accounting for a fixed-capacity descriptor pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolBudget {
    name: &'static str,
    capacity: u32,
    used: u32,
}

impl PoolBudget {
    pub fn new(name: &'static str, capacity: u32) -> Self {
        Self {
            name,
            capacity,
            used: 0,
        }
    }

    pub fn reserve(&mut self) -> Result<()> {
        if self.used >= self.capacity {
            log::error!("Descriptor pool '{}' exhausted at {} sets", self.name, self.capacity);
            return Err(GraphicsError::DescriptorPoolExhausted {
                pool: self.name,
                capacity: self.capacity,
            });
        }
        self.used += 1;
        Ok(())
    }

    pub fn release(&mut self) {
        debug_assert!(self.used > 0, "release without reserve on pool '{}'", self.name);
        self.used = self.used.saturating_sub(1);
    }

    pub fn used(&self) -> u32 {
        self.used
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }
}

/// One registered texture. Blank until pixel data is uploaded.
#[derive(Default)]
pub struct TextureBinding {
    pub texture: Option<TextureImage>,
    /// Dedicated single-image set for ad-hoc use such as UI image widgets.
    pub ui_set: Option<OwnedDescriptorSet>,
}

/// Texture rows keyed by generational id, with their single-image pool
/// reservations.
pub struct TextureRegistry {
    rows: SlotMap<TextureId, TextureBinding>,
    budget: PoolBudget,
}

impl TextureRegistry {
    pub fn new(single_image_capacity: u32) -> Self {
        Self {
            rows: SlotMap::with_key(),
            budget: PoolBudget::new("single-image", single_image_capacity),
        }
    }

    pub fn register(&mut self) -> Result<TextureId> {
        self.budget.reserve()?;
        Ok(self.rows.insert(TextureBinding::default()))
    }

    /// Removes the row and hands it back so the caller controls when the
    /// GPU objects inside are dropped.
    pub fn unregister(&mut self, id: TextureId) -> Result<TextureBinding> {
        let row = self.rows.remove(id).ok_or(GraphicsError::StaleTexture)?;
        self.budget.release();
        Ok(row)
    }

    pub fn get(&self, id: TextureId) -> Result<&TextureBinding> {
        self.rows.get(id).ok_or(GraphicsError::StaleTexture)
    }

    pub fn get_mut(&mut self, id: TextureId) -> Result<&mut TextureBinding> {
        self.rows.get_mut(id).ok_or(GraphicsError::StaleTexture)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn budget(&self) -> PoolBudget {
        self.budget
    }
}

/// Ordered texture ids for the array binding of the batch being recorded.
#[derive(Debug, Default)]
pub struct BoundTextures {
    ids: Vec<TextureId>,
}

impl BoundTextures {
    /// Array index of `id`, appending it if needed. `None` once the array is
    /// full: the caller has to end the batch and start another one.
    pub fn bind(&mut self, id: TextureId) -> Option<u32> {
        if let Some(index) = self.ids.iter().position(|&bound| bound == id) {
            return Some(index as u32);
        }
        if self.ids.len() as u32 >= MAX_BOUND_TEXTURES {
            return None;
        }
        self.ids.push(id);
        Some(self.ids.len() as u32 - 1)
    }

    pub fn reset(&mut self) {
        self.ids.clear();
    }

    pub fn remove(&mut self, id: TextureId) {
        self.ids.retain(|&bound| bound != id);
    }

    pub fn ids(&self) -> &[TextureId] {
        &self.ids
    }
}

/// Remembers what each descriptor set was last written with.
#[derive(Debug)]
pub struct CommitCache {
    written: Vec<Option<Vec<(u64, u64)>>>,
}

impl CommitCache {
    pub fn new(sets: usize) -> Self {
        Self {
            written: vec![None; sets],
        }
    }

    /// True if `set` must be rewritten to hold `contents`; records `contents`.
    pub fn needs_write(&mut self, set: usize, contents: Vec<(u64, u64)>) -> bool {
        if self.written[set].as_ref() == Some(&contents) {
            return false;
        }
        self.written[set] = Some(contents);
        true
    }

    /// Forget everything, e.g. after a texture was destroyed.
    pub fn invalidate(&mut self) {
        self.written.iter_mut().for_each(|entry| *entry = None);
    }
}

/// A host-visible destination for uniform data.
pub trait UniformTarget {
    fn capacity(&self) -> u64;
    fn write(&mut self, data: &[u8]) -> Result<()>;
}

impl UniformTarget for AllocatedBuffer {
    fn capacity(&self) -> u64 {
        self.size()
    }

    fn write(&mut self, data: &[u8]) -> Result<()> {
        self.write_bytes(data)
    }
}

/// The slot of the frame currently between `begin_frame` and `present`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ActiveSlot(Option<usize>);

impl ActiveSlot {
    pub fn open(&mut self, slot: usize) {
        self.0 = Some(slot);
    }

    pub fn close(&mut self) {
        self.0 = None;
    }

    pub fn get(&self, op: &'static str) -> Result<usize> {
        self.0
            .ok_or(GraphicsError::InvalidFrameState { op, state: "Idle" })
    }
}

/// Writes `data` into the open frame's uniform buffer.
pub fn write_uniform<T: UniformTarget>(
    uniforms: Option<&mut UniformRing<T>>,
    active: &ActiveSlot,
    data: &[u8],
) -> Result<()> {
    let slot = active.get("set_uniform_data")?;
    uniforms
        .ok_or(GraphicsError::UniformNotRegistered)?
        .write(slot, data)
}

/// One uniform buffer per frame slot.
pub struct UniformRing<T> {
    slots: Vec<T>,
    size: u64,
}

impl<T: UniformTarget> UniformRing<T> {
    pub fn new(slots: Vec<T>, size: u64) -> Self {
        Self { slots, size }
    }

    /// Writes only `slot`'s buffer; the other slots may still be read by the GPU.
    pub fn write(&mut self, slot: usize, data: &[u8]) -> Result<()> {
        if data.len() as u64 > self.size {
            return Err(GraphicsError::UniformTooLarge {
                data_bytes: data.len(),
                buffer_bytes: self.size,
            });
        }
        self.slots[slot].write(data)
    }

    pub fn slot(&self, slot: usize) -> &T {
        &self.slots[slot]
    }

    pub fn size(&self) -> u64 {
        self.size
    }
}

pub struct ResourceBindingTable {
    // Per slot, per batch. Freed together with `_frame_pool`.
    frame_sets: Vec<Vec<vk::DescriptorSet>>,
    committed: CommitCache,
    bound: BoundTextures,
    registry: TextureRegistry,
    uniforms: Option<UniformRing<AllocatedBuffer>>,
    active: ActiveSlot,
    max_batches: usize,

    ui_pool: OwnedDescriptorPool,
    single_image_pool: Arc<OwnedDescriptorPool>,
    // Only held so the sets above stay valid; destroyed in Drop.
    _frame_pool: OwnedDescriptorPool,
    single_image_layout: OwnedDescriptorSetLayout,
    layout: OwnedDescriptorSetLayout,
    device: Arc<LogicalDevice>,
}

impl ResourceBindingTable {
    pub fn new(device: &Arc<LogicalDevice>, config: &GraphicsConfig) -> Result<Self> {
        let frames = config.frames_in_flight;
        let max_batches = config.max_batches_per_frame as usize;
        let frame_set_count = (frames * max_batches) as u32;

        let layout = create_frame_layout(device)?;
        let single_image_layout = create_single_image_layout(device)?;

        let frame_pool = create_pool(
            device,
            &[
                pool_size(vk::DescriptorType::UNIFORM_BUFFER, frame_set_count),
                pool_size(
                    vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                    frame_set_count * MAX_BOUND_TEXTURES,
                ),
            ],
            frame_set_count,
            vk::DescriptorPoolCreateFlags::empty(),
        )?;

        let single_image_pool = Arc::new(create_pool(
            device,
            &[pool_size(
                vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                config.single_image_pool_size,
            )],
            config.single_image_pool_size,
            vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET,
        )?);

        let ui_pool = create_ui_pool(device, config.ui_pool_size)?;

        let layouts = vec![layout.raw(); frame_set_count as usize];
        let alloc_info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(frame_pool.raw())
            .set_layouts(&layouts);
        let sets = unsafe { device.device.allocate_descriptor_sets(&alloc_info) }
            .map_err(GraphicsError::CreatingDescriptorSet)?;
        let frame_sets = sets.chunks(max_batches).map(<[_]>::to_vec).collect();

        log::info!(
            "Descriptor pools ready: {} frame sets, {} single-image sets, {} UI sets",
            frame_set_count,
            config.single_image_pool_size,
            config.ui_pool_size
        );

        Ok(Self {
            frame_sets,
            committed: CommitCache::new(frame_set_count as usize),
            bound: BoundTextures::default(),
            registry: TextureRegistry::new(config.single_image_pool_size),
            uniforms: None,
            active: ActiveSlot::default(),
            max_batches,
            ui_pool,
            single_image_pool,
            _frame_pool: frame_pool,
            single_image_layout,
            layout,
            device: device.clone(),
        })
    }

    pub fn layout(&self) -> vk::DescriptorSetLayout {
        self.layout.raw()
    }

    /// Pool reserved for an external UI layer.
    pub fn ui_descriptor_pool(&self) -> vk::DescriptorPool {
        self.ui_pool.raw()
    }

    /// A frame opened on `slot`; its per-frame resources may be written.
    pub(crate) fn open_slot(&mut self, slot: usize) {
        self.active.open(slot);
    }

    /// The open frame was handed to presentation.
    pub(crate) fn close_slot(&mut self) {
        self.active.close();
    }

    pub fn descriptor_set(&self, slot: usize, batch: usize) -> Result<vk::DescriptorSet> {
        if batch >= self.max_batches {
            log::error!("Batch {} exceeds max_batches_per_frame ({})", batch, self.max_batches);
            return Err(GraphicsError::DescriptorPoolExhausted {
                pool: "frame",
                capacity: self.max_batches as u32,
            });
        }
        Ok(self.frame_sets[slot][batch])
    }

    // ── uniforms ─────────────────────────────────────────────────────────

    /// One persistently mapped buffer per frame slot, wired into binding 0
    /// of every set of that slot.
    pub fn register_uniform(&mut self, size: u64) -> Result<()> {
        if self.uniforms.is_some() {
            // Replacing buffers the GPU may still read.
            self.device.wait_idle()?;
        }

        let buffers = (0..self.frame_sets.len())
            .map(|slot| {
                AllocatedBuffer::new(
                    &self.device,
                    size,
                    vk::BufferUsageFlags::UNIFORM_BUFFER,
                    gpu_allocator::MemoryLocation::CpuToGpu,
                    &format!("uniform slot {}", slot),
                )
            })
            .collect::<Result<Vec<_>>>()?;

        for (slot, buffer) in buffers.iter().enumerate() {
            let buffer_info = [vk::DescriptorBufferInfo {
                buffer: buffer.buffer,
                offset: 0,
                range: size,
            }];
            let writes: Vec<_> = self.frame_sets[slot]
                .iter()
                .map(|&set| {
                    vk::WriteDescriptorSet::builder()
                        .dst_set(set)
                        .dst_binding(UNIFORM_BINDING)
                        .dst_array_element(0)
                        .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
                        .buffer_info(&buffer_info)
                        .build()
                })
                .collect();
            unsafe { self.device.device.update_descriptor_sets(&writes, &[]) };
        }

        log::debug!("Registered {}-byte uniform for {} slots", size, buffers.len());
        self.uniforms = Some(UniformRing::new(buffers, size));
        Ok(())
    }

    /// Writes the uniform buffer of the frame being recorded. Fails outside
    /// `begin_frame`/`present`, where every slot may still be in use.
    pub fn set_uniform_data(&mut self, data: &[u8]) -> Result<()> {
        write_uniform(self.uniforms.as_mut(), &self.active, data)
    }

    // ── textures ─────────────────────────────────────────────────────────

    pub fn register_texture(&mut self) -> Result<TextureId> {
        let id = self.registry.register()?;
        log::debug!("Registered texture {:?}", id);
        Ok(id)
    }

    pub fn unregister_texture(&mut self, id: TextureId) -> Result<()> {
        self.registry.get(id)?;
        self.device.wait_idle()?;

        let row = self.registry.unregister(id)?;
        self.bound.remove(id);
        self.committed.invalidate();
        drop(row);

        log::debug!("Unregistered texture {:?}", id);
        Ok(())
    }

    /// Uploads pixels into a registered texture, replacing earlier contents.
    pub fn set_texture_data(
        &mut self,
        id: TextureId,
        width: u32,
        height: u32,
        layout: PixelLayout,
        data: &[u8],
    ) -> Result<()> {
        self.registry.get(id)?;
        let texture = TextureImage::upload(&self.device, width, height, layout, data)?;

        let replacing = self.registry.get(id)?.texture.is_some();
        if replacing {
            self.device.wait_idle()?;
            self.committed.invalidate();
        }

        let row = self.registry.get_mut(id)?;
        row.ui_set = None;
        row.texture = Some(texture);
        Ok(())
    }

    pub fn texture_bind(&mut self, id: TextureId) -> Result<Option<u32>> {
        self.registry.get(id)?;
        Ok(self.bound.bind(id))
    }

    pub fn reset_texture_bind(&mut self) {
        self.bound.reset();
    }

    pub fn bound_textures(&self) -> &[TextureId] {
        self.bound.ids()
    }

    /// Writes the accumulated texture list into the set of `slot`/`batch`.
    /// Skips the write when that set already holds the same list.
    pub fn commit_texture_bind(&mut self, slot: usize, batch: usize) -> Result<()> {
        let set = self.descriptor_set(slot, batch)?;

        let mut infos = Vec::with_capacity(self.bound.ids().len());
        for &id in self.bound.ids() {
            let texture = self
                .registry
                .get(id)?
                .texture
                .as_ref()
                .ok_or(GraphicsError::TextureNotUploaded)?;
            infos.push(texture.descriptor_info());
        }

        let contents = infos
            .iter()
            .map(|info| (info.sampler.as_raw(), info.image_view.as_raw()))
            .collect();
        if !self.committed.needs_write(slot * self.max_batches + batch, contents) {
            return Ok(());
        }
        if infos.is_empty() {
            return Ok(());
        }

        let write = vk::WriteDescriptorSet::builder()
            .dst_set(set)
            .dst_binding(TEXTURE_ARRAY_BINDING)
            .dst_array_element(0)
            .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
            .image_info(&infos)
            .build();
        unsafe { self.device.device.update_descriptor_sets(&[write], &[]) };
        Ok(())
    }

    /// Dedicated single-image set for `id`, allocated on first request.
    pub fn texture_descriptor(&mut self, id: TextureId) -> Result<vk::DescriptorSet> {
        let capacity = self.registry.budget().capacity();
        let row = self.registry.get_mut(id)?;
        if let Some(set) = &row.ui_set {
            return Ok(set.raw());
        }
        let info = [row
            .texture
            .as_ref()
            .ok_or(GraphicsError::TextureNotUploaded)?
            .descriptor_info()];

        let layouts = [self.single_image_layout.raw()];
        let alloc_info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(self.single_image_pool.raw())
            .set_layouts(&layouts);
        let raw = unsafe { self.device.device.allocate_descriptor_sets(&alloc_info) }
            .map_err(|e| match e {
                vk::Result::ERROR_OUT_OF_POOL_MEMORY | vk::Result::ERROR_FRAGMENTED_POOL => {
                    GraphicsError::DescriptorPoolExhausted {
                        pool: "single-image",
                        capacity,
                    }
                }
                e => GraphicsError::CreatingDescriptorSet(e),
            })?[0];

        let write = vk::WriteDescriptorSet::builder()
            .dst_set(raw)
            .dst_binding(0)
            .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
            .image_info(&info)
            .build();
        unsafe { self.device.device.update_descriptor_sets(&[write], &[]) };

        row.ui_set = Some(OwnedDescriptorSet::new(&self.single_image_pool, raw));
        Ok(raw)
    }

    pub fn texture_count(&self) -> usize {
        self.registry.len()
    }

    pub fn single_image_budget(&self) -> PoolBudget {
        self.registry.budget()
    }
}

fn pool_size(ty: vk::DescriptorType, descriptor_count: u32) -> vk::DescriptorPoolSize {
    vk::DescriptorPoolSize {
        ty,
        descriptor_count,
    }
}

fn create_pool(
    device: &Arc<LogicalDevice>,
    sizes: &[vk::DescriptorPoolSize],
    max_sets: u32,
    flags: vk::DescriptorPoolCreateFlags,
) -> Result<OwnedDescriptorPool> {
    let info = vk::DescriptorPoolCreateInfo::builder()
        .flags(flags)
        .pool_sizes(sizes)
        .max_sets(max_sets);
    let pool = unsafe { device.device.create_descriptor_pool(&info, None) }.map_err(|e| {
        log::error!("vkCreateDescriptorPool failed: {:?}", e);
        GraphicsError::CreatingDescriptorPool(e)
    })?;
    Ok(Owned::new(device, pool))
}

fn create_ui_pool(device: &Arc<LogicalDevice>, per_type: u32) -> Result<OwnedDescriptorPool> {
    let sizes: Vec<_> = [
        vk::DescriptorType::SAMPLER,
        vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
        vk::DescriptorType::SAMPLED_IMAGE,
        vk::DescriptorType::STORAGE_IMAGE,
        vk::DescriptorType::UNIFORM_TEXEL_BUFFER,
        vk::DescriptorType::STORAGE_TEXEL_BUFFER,
        vk::DescriptorType::UNIFORM_BUFFER,
        vk::DescriptorType::STORAGE_BUFFER,
        vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC,
        vk::DescriptorType::STORAGE_BUFFER_DYNAMIC,
        vk::DescriptorType::INPUT_ATTACHMENT,
    ]
    .into_iter()
    .map(|ty| pool_size(ty, per_type))
    .collect();

    create_pool(
        device,
        &sizes,
        per_type,
        vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET,
    )
}

fn create_frame_layout(device: &Arc<LogicalDevice>) -> Result<OwnedDescriptorSetLayout> {
    let bindings = [
        vk::DescriptorSetLayoutBinding::builder()
            .binding(UNIFORM_BINDING)
            .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
            .descriptor_count(1)
            .stage_flags(vk::ShaderStageFlags::VERTEX)
            .build(),
        vk::DescriptorSetLayoutBinding::builder()
            .binding(TEXTURE_ARRAY_BINDING)
            .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
            .descriptor_count(MAX_BOUND_TEXTURES)
            .stage_flags(vk::ShaderStageFlags::FRAGMENT)
            .build(),
    ];
    create_layout(device, &bindings)
}

fn create_single_image_layout(device: &Arc<LogicalDevice>) -> Result<OwnedDescriptorSetLayout> {
    let bindings = [vk::DescriptorSetLayoutBinding::builder()
        .binding(0)
        .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
        .descriptor_count(1)
        .stage_flags(vk::ShaderStageFlags::FRAGMENT)
        .build()];
    create_layout(device, &bindings)
}

fn create_layout(
    device: &Arc<LogicalDevice>,
    bindings: &[vk::DescriptorSetLayoutBinding],
) -> Result<OwnedDescriptorSetLayout> {
    let info = vk::DescriptorSetLayoutCreateInfo::builder().bindings(bindings);
    let layout = unsafe { device.device.create_descriptor_set_layout(&info, None) }
        .map_err(GraphicsError::CreatingDescriptorSetLayout)?;
    Ok(Owned::new(device, layout))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::sync::SlotRing;

    /// In-memory stand-in for a mapped uniform buffer.
    struct HostBytes(Vec<u8>);

    impl UniformTarget for HostBytes {
        fn capacity(&self) -> u64 {
            self.0.len() as u64
        }

        fn write(&mut self, data: &[u8]) -> Result<()> {
            self.0[..data.len()].copy_from_slice(data);
            Ok(())
        }
    }

    #[test]
    fn register_five_unregister_three() {
        let mut registry = TextureRegistry::new(100);
        let baseline = registry.budget().used();

        let ids: Vec<_> = (0..5).map(|_| registry.register().unwrap()).collect();
        assert_eq!(registry.budget().used(), baseline + 5);

        for &id in &ids[..3] {
            let row = registry.unregister(id).unwrap();
            assert!(row.texture.is_none());
            assert!(row.ui_set.is_none());
        }

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.budget().used(), baseline + 2);
        assert!(registry.get(ids[3]).is_ok());
        assert!(registry.get(ids[4]).is_ok());
    }

    #[test]
    fn stale_ids_do_not_alias_new_rows() {
        let mut registry = TextureRegistry::new(8);
        let old = registry.register().unwrap();
        registry.unregister(old).unwrap();

        // Slot gets reused, generation does not.
        let new = registry.register().unwrap();
        assert_ne!(old, new);
        assert!(matches!(registry.get(old), Err(GraphicsError::StaleTexture)));
        assert!(matches!(registry.unregister(old), Err(GraphicsError::StaleTexture)));
        assert!(registry.get(new).is_ok());
    }

    #[test]
    fn pool_exhaustion_is_reported() {
        let mut registry = TextureRegistry::new(2);
        registry.register().unwrap();
        registry.register().unwrap();
        let err = registry.register().unwrap_err();
        assert!(matches!(
            err,
            GraphicsError::DescriptorPoolExhausted { pool: "single-image", capacity: 2 }
        ));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn budget_release_frees_capacity() {
        let mut budget = PoolBudget::new("test", 1);
        budget.reserve().unwrap();
        assert!(budget.reserve().is_err());
        budget.release();
        assert_eq!(budget.used(), 0);
        budget.reserve().unwrap();
    }

    #[test]
    fn bound_textures_dedup_and_fill_up() {
        let mut registry = TextureRegistry::new(64);
        let ids: Vec<_> = (0..MAX_BOUND_TEXTURES + 1)
            .map(|_| registry.register().unwrap())
            .collect();

        let mut bound = BoundTextures::default();
        assert_eq!(bound.bind(ids[0]), Some(0));
        assert_eq!(bound.bind(ids[1]), Some(1));
        assert_eq!(bound.bind(ids[0]), Some(0));

        for (i, &id) in ids.iter().enumerate().take(MAX_BOUND_TEXTURES as usize).skip(2) {
            assert_eq!(bound.bind(id), Some(i as u32));
        }
        assert_eq!(bound.ids().len(), MAX_BOUND_TEXTURES as usize);

        // Full: the batch has to be split.
        assert_eq!(bound.bind(ids[MAX_BOUND_TEXTURES as usize]), None);
        // Already bound ids still resolve.
        assert_eq!(bound.bind(ids[5]), Some(5));

        bound.reset();
        assert!(bound.ids().is_empty());
        assert_eq!(bound.bind(ids[MAX_BOUND_TEXTURES as usize]), Some(0));
    }

    #[test]
    fn removing_a_bound_texture_compacts_the_list() {
        let mut registry = TextureRegistry::new(4);
        let a = registry.register().unwrap();
        let b = registry.register().unwrap();
        let mut bound = BoundTextures::default();
        bound.bind(a);
        bound.bind(b);
        bound.remove(a);
        assert_eq!(bound.ids(), &[b]);
    }

    #[test]
    fn commit_is_idempotent_per_set() {
        let mut cache = CommitCache::new(4);
        let list = vec![(1, 2), (3, 4)];

        assert!(cache.needs_write(0, list.clone()));
        assert!(!cache.needs_write(0, list.clone()));
        // Other sets are tracked separately.
        assert!(cache.needs_write(1, list.clone()));
        // A changed list is written again.
        assert!(cache.needs_write(0, vec![(1, 2)]));

        cache.invalidate();
        assert!(cache.needs_write(0, vec![(1, 2)]));
    }

    #[test]
    fn uniform_writes_follow_the_open_frame() {
        let mut ring = UniformRing::new(vec![HostBytes(vec![0; 4]), HostBytes(vec![0; 4])], 4);
        let mut slots = SlotRing::new(2);
        let mut active = ActiveSlot::default();

        for frame in 0..5u8 {
            // begin_frame
            active.open(slots.current());
            write_uniform(Some(&mut ring), &active, &[frame; 4]).unwrap();
            // present
            active.close();
            slots.advance();

            // Between present and the next begin_frame no slot is safe.
            let err = write_uniform(Some(&mut ring), &active, &[0xff; 4]).unwrap_err();
            assert!(matches!(
                err,
                GraphicsError::InvalidFrameState { op: "set_uniform_data", state: "Idle" }
            ));
        }

        // Frame 3 ran in slot 1 and frame 4's write left it alone.
        assert_eq!(ring.slot(1).0, vec![3; 4]);
        assert_eq!(ring.slot(0).0, vec![4; 4]);
    }

    #[test]
    fn uniform_must_be_registered() {
        let mut active = ActiveSlot::default();
        active.open(0);
        let err = write_uniform::<HostBytes>(None, &active, &[1]).unwrap_err();
        assert!(matches!(err, GraphicsError::UniformNotRegistered));
    }

    #[test]
    fn oversized_uniform_is_rejected() {
        let mut ring = UniformRing::new(vec![HostBytes(vec![0; 8]), HostBytes(vec![0; 8])], 8);
        let err = ring.write(0, &[0; 9]).unwrap_err();
        assert!(matches!(
            err,
            GraphicsError::UniformTooLarge { data_bytes: 9, buffer_bytes: 8 }
        ));
        assert_eq!(ring.slot(0).capacity(), 8);
    }
}
