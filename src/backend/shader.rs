// Shader module loading
//
// Shaders arrive as SPIR-V bytes, compiled ahead of time. The bytes are
// realigned to 32-bit words before the driver sees them.

use ash::vk;
use std::io::Cursor;
use std::sync::Arc;

use super::handle::{Owned, OwnedShaderModule};
use super::LogicalDevice;
use crate::error::{GraphicsError, Result};

/// Decode SPIR-V bytes into words, checking length and magic number.
pub fn spirv_words(code: &[u8]) -> Result<Vec<u32>> {
    ash::util::read_spv(&mut Cursor::new(code))
        .map_err(|e| GraphicsError::InvalidShaderCode(e.to_string()))
}

/// Load SPIR-V shader from bytes and create a shader module
pub fn create_shader_module(device: &Arc<LogicalDevice>, code: &[u8]) -> Result<OwnedShaderModule> {
    let words = spirv_words(code)?;
    let create_info = vk::ShaderModuleCreateInfo::builder().code(&words);

    let module = unsafe { device.device.create_shader_module(&create_info, None) }
        .map_err(GraphicsError::CreatingShaderModule)?;
    Ok(Owned::new(device, module))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SPIRV_MAGIC: u32 = 0x0723_0203;

    #[test]
    fn accepts_word_aligned_spirv() {
        let mut bytes = SPIRV_MAGIC.to_le_bytes().to_vec();
        bytes.extend_from_slice(&0x0001_0000u32.to_le_bytes());
        let words = spirv_words(&bytes).unwrap();
        assert_eq!(words, vec![SPIRV_MAGIC, 0x0001_0000]);
    }

    #[test]
    fn rejects_length_not_multiple_of_four() {
        let mut bytes = SPIRV_MAGIC.to_le_bytes().to_vec();
        bytes.push(0);
        assert!(matches!(
            spirv_words(&bytes),
            Err(GraphicsError::InvalidShaderCode(_))
        ));
    }

    #[test]
    fn rejects_empty_input() {
        assert!(spirv_words(&[]).is_err());
    }
}
