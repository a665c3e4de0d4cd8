//! Shared-memory regions backed by temp files.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use memmap2::{MmapMut, MmapOptions};
use tempfile::NamedTempFile;

/// One mapped region. The creating side keeps the backing temp file alive;
/// the attaching side opens it by path.
pub struct ShmRegion {
    mmap: MmapMut,
    path: PathBuf,
    len: usize,
    owner: Option<NamedTempFile>,
    attached: Option<File>,
}

impl ShmRegion {
    /// Creates a `stagewire-bridge_<role>_<random>` backing file of `len`
    /// bytes and maps it.
    pub fn create(role: &str, len: usize) -> Result<Self> {
        let file = tempfile::Builder::new()
            .prefix(&format!("stagewire-bridge_{role}_"))
            .tempfile()
            .with_context(|| format!("failed to allocate shared region for {role}"))?;
        file.as_file()
            .set_len(len as u64)
            .with_context(|| format!("failed to size shared region for {role}"))?;
        let mmap = unsafe { MmapOptions::new().len(len).map_mut(file.as_file())? };
        Ok(Self {
            path: file.path().to_path_buf(),
            mmap,
            len,
            owner: Some(file),
            attached: None,
        })
    }

    /// Maps an existing region created by the peer process.
    pub fn attach(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .with_context(|| format!("failed to open shared region {}", path.display()))?;
        let len = file.metadata()?.len() as usize;
        let mmap = unsafe { MmapOptions::new().len(len).map_mut(&file)? };
        Ok(Self {
            path: path.to_path_buf(),
            mmap,
            len,
            owner: None,
            attached: Some(file),
        })
    }

    /// Grows or shrinks the backing file and remaps. Creator side only; the
    /// peer re-attaches after being told the new size.
    pub fn remap(&mut self, len: usize) -> Result<()> {
        let file = self
            .owner
            .as_ref()
            .map(|f| f.as_file())
            .or(self.attached.as_ref())
            .context("region has no backing file")?;
        file.set_len(len as u64)?;
        self.mmap = unsafe { MmapOptions::new().len(len).map_mut(file)? };
        self.len = len;
        Ok(())
    }

    /// Re-attach path for a peer that was told the region changed size.
    pub fn reattach(&mut self) -> Result<()> {
        let file = self.attached.as_ref().context("not an attached region")?;
        let len = file.metadata()?.len() as usize;
        self.mmap = unsafe { MmapOptions::new().len(len).map_mut(file)? };
        self.len = len;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.mmap.as_ptr()
    }

    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.mmap.as_mut_ptr()
    }
}

/// The contiguous float pool both sides stream audio through.
///
/// Layout per cycle: `audio_in + cv_in` input slots first, then `audio_out +
/// cv_out` output slots, each slot `buffer_size` floats.
pub struct AudioPool {
    region: ShmRegion,
    buffer_size: u32,
    input_slots: u32,
    output_slots: u32,
}

impl AudioPool {
    pub fn create(buffer_size: u32) -> Result<Self> {
        let region = ShmRegion::create("pool", Self::byte_len(buffer_size, 0, 0))?;
        Ok(Self {
            region,
            buffer_size,
            input_slots: 0,
            output_slots: 0,
        })
    }

    pub fn attach(path: &Path) -> Result<Self> {
        let region = ShmRegion::attach(path)?;
        Ok(Self {
            region,
            buffer_size: 0,
            input_slots: 0,
            output_slots: 0,
        })
    }

    fn byte_len(buffer_size: u32, input_slots: u32, output_slots: u32) -> usize {
        let floats = ((input_slots + output_slots) as usize) * buffer_size as usize;
        floats.max(1) * std::mem::size_of::<f32>()
    }

    /// Resizes for a new buffer size or port layout. The caller coordinates
    /// with the peer so no rendezvous straddles the remap.
    pub fn resize(&mut self, buffer_size: u32, input_slots: u32, output_slots: u32) -> Result<()> {
        self.buffer_size = buffer_size;
        self.input_slots = input_slots;
        self.output_slots = output_slots;
        self.region
            .remap(Self::byte_len(buffer_size, input_slots, output_slots))
    }

    /// Worker-side view refresh after a size announcement.
    pub fn update_layout(&mut self, buffer_size: u32, input_slots: u32, output_slots: u32) -> Result<()> {
        self.buffer_size = buffer_size;
        self.input_slots = input_slots;
        self.output_slots = output_slots;
        self.region.reattach()
    }

    /// Remaps the backing file at its current size, before the geometry
    /// announcement arrives on the RT ring.
    pub fn reattach_region(&mut self) -> Result<()> {
        self.region.reattach()
    }

    pub fn path(&self) -> &Path {
        self.region.path()
    }

    pub fn buffer_size(&self) -> u32 {
        self.buffer_size
    }

    fn slot(&self, index: u32) -> *const f32 {
        let offset = index as usize * self.buffer_size as usize;
        unsafe { (self.region.as_ptr() as *const f32).add(offset) }
    }

    fn slot_mut(&mut self, index: u32) -> *mut f32 {
        let offset = index as usize * self.buffer_size as usize;
        unsafe { (self.region.as_mut_ptr() as *mut f32).add(offset) }
    }

    /// Copies one input channel into its leading slot.
    pub fn write_input(&mut self, slot: u32, samples: &[f32]) {
        debug_assert!(slot < self.input_slots);
        let frames = samples.len().min(self.buffer_size as usize);
        unsafe {
            std::ptr::copy_nonoverlapping(samples.as_ptr(), self.slot_mut(slot), frames);
        }
    }

    /// Copies one output channel out of its trailing slot.
    pub fn read_output(&self, slot: u32, samples: &mut [f32]) {
        debug_assert!(slot < self.output_slots);
        let frames = samples.len().min(self.buffer_size as usize);
        let src = self.slot(self.input_slots + slot);
        unsafe {
            std::ptr::copy_nonoverlapping(src, samples.as_mut_ptr(), frames);
        }
    }

    /// Worker-side accessors: inputs lead, outputs trail.
    pub fn input_slice(&self, slot: u32, frames: u32) -> &[f32] {
        debug_assert!(slot < self.input_slots);
        unsafe { std::slice::from_raw_parts(self.slot(slot), frames as usize) }
    }

    pub fn output_slice_mut(&mut self, slot: u32, frames: u32) -> &mut [f32] {
        debug_assert!(slot < self.output_slots);
        let index = self.input_slots + slot;
        unsafe { std::slice::from_raw_parts_mut(self.slot_mut(index), frames as usize) }
    }

    /// Zero-fills every trailing output slot, the silence fallback when the
    /// worker cannot be reached.
    pub fn silence_outputs(&mut self) {
        for slot in 0..self.output_slots {
            let index = self.input_slots + slot;
            let frames = self.buffer_size;
            unsafe {
                std::ptr::write_bytes(self.slot_mut(index), 0, frames as usize);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_roundtrip_between_views() {
        let mut pool = AudioPool::create(64).unwrap();
        pool.resize(64, 2, 2).unwrap();

        let mut peer = AudioPool::attach(&pool.path().to_path_buf()).unwrap();
        peer.update_layout(64, 2, 2).unwrap();

        let samples: Vec<f32> = (0..64).map(|i| i as f32 / 64.0).collect();
        pool.write_input(0, &samples);

        // Worker copies input 0 to output 1.
        let input = peer.input_slice(0, 64).to_vec();
        peer.output_slice_mut(1, 64).copy_from_slice(&input);

        let mut out = vec![0.0f32; 64];
        pool.read_output(1, &mut out);
        assert_eq!(out, samples);
    }

    #[test]
    fn empty_pool_still_maps_one_float() {
        let pool = AudioPool::create(512).unwrap();
        assert!(pool.region.len() >= std::mem::size_of::<f32>());
    }
}
