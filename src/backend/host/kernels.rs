//! Reference kernels for the host device
//!
//! Small kernels used by the probe binary, benches and tests. One work item
//! handles one element.

use crate::backend::device::LaunchConfig;
use crate::backend::host::HostKernel;
use crate::error::{ForgeError, ForgeResult};

fn words_mut(bytes: &mut [u8]) -> ForgeResult<&mut [u32]> {
    bytemuck::try_cast_slice_mut(bytes).map_err(|e| {
        ForgeError::DeviceResourceError(format!("buffer is not a u32 array: {}", e))
    })
}

fn expect_args(kernel: &str, args: &[&mut [u8]], count: usize) -> ForgeResult<()> {
    if args.len() != count {
        return Err(ForgeError::DeviceResourceError(format!(
            "kernel '{}' takes {} buffer arguments, got {}",
            kernel,
            count,
            args.len()
        )));
    }
    Ok(())
}

/// `dst[i] = src[i]` for each byte work item (args: src, dst)
pub fn identity_copy() -> HostKernel {
    HostKernel::new("identity_copy", |launch: &LaunchConfig, args: &mut [&mut [u8]]| {
        expect_args("identity_copy", args, 2)?;
        let (src, dst) = args.split_at_mut(1);
        let n = launch.work_items().min(src[0].len()).min(dst[0].len());
        dst[0][..n].copy_from_slice(&src[0][..n]);
        Ok(())
    })
}

/// `buf[i] += 1` for each `u32` work item, wrapping (args: buf)
pub fn increment_u32() -> HostKernel {
    HostKernel::new("increment_u32", |launch: &LaunchConfig, args: &mut [&mut [u8]]| {
        expect_args("increment_u32", args, 1)?;
        let words = words_mut(&mut args[0][..])?;
        let n = launch.work_items().min(words.len());
        for word in &mut words[..n] {
            *word = word.wrapping_add(1);
        }
        Ok(())
    })
}

/// `buf[i] = i` for each `u32` work item (args: buf)
pub fn fill_index_u32() -> HostKernel {
    HostKernel::new("fill_index_u32", |launch: &LaunchConfig, args: &mut [&mut [u8]]| {
        expect_args("fill_index_u32", args, 1)?;
        let words = words_mut(&mut args[0][..])?;
        let n = launch.work_items().min(words.len());
        for (i, word) in words[..n].iter_mut().enumerate() {
            *word = i as u32;
        }
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(kernel: &HostKernel, launch: LaunchConfig, args: &mut [&mut [u8]]) -> ForgeResult<()> {
        (kernel.func())(&launch, args)
    }

    #[test]
    fn test_identity_copy() {
        let mut src = vec![1u8, 2, 3, 4];
        let mut dst = vec![0u8; 4];
        run(&identity_copy(), LaunchConfig::linear(4), &mut [&mut src[..], &mut dst[..]]).unwrap();
        assert_eq!(dst, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_increment_respects_work_items() {
        let mut bytes = vec![0u32; 4];
        let view: &mut [u8] = bytemuck::cast_slice_mut(&mut bytes[..]);
        run(&increment_u32(), LaunchConfig::linear(2), &mut [view]).unwrap();
        assert_eq!(bytes, vec![1, 1, 0, 0]);
    }

    #[test]
    fn test_wrong_argument_count() {
        let mut bytes = vec![0u8; 8];
        let err = run(&increment_u32(), LaunchConfig::linear(2), &mut [&mut bytes[..], &mut []]);
        assert!(err.is_err());
    }
}
