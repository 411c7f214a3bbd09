use std::fs::File;

use memmap2::MmapMut;
use tempfile::{NamedTempFile, TempPath};

use crate::core::Result;

/// 临时文件上的可写映射。释放（`close` 或 drop）时删除临时文件。
pub struct TempMapping {
    mmap: MmapMut,
    _file: File,
    path: Option<TempPath>,
}

impl TempMapping {
    /// `len` 必须 > 0（零长度映射由调用方以 `None` 表示）。
    pub fn create(len: u64) -> Result<Self> {
        let (file, path) = NamedTempFile::new()?.into_parts();
        file.set_len(len)?;
        let mmap = unsafe { MmapMut::map_mut(&file)? };
        Ok(Self {
            mmap,
            _file: file,
            path: Some(path),
        })
    }

    pub fn len(&self) -> u64 {
        self.mmap.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.mmap.is_empty()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.mmap
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.mmap
    }

    pub fn flush(&self) -> Result<()> {
        self.mmap.flush()?;
        Ok(())
    }

    /// 解除映射并删除后备文件，返回删除失败（如果有）。
    pub fn close(mut self) -> Result<()> {
        let path = self.path.take();
        drop(self);
        if let Some(p) = path {
            p.close()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mapping_is_zero_filled_and_writable() {
        let mut m = TempMapping::create(64).unwrap();
        assert_eq!(m.len(), 64);
        assert!(m.bytes().iter().all(|b| *b == 0));
        m.bytes_mut()[10] = 0xCD;
        assert_eq!(m.bytes()[10], 0xCD);
        m.close().unwrap();
    }

    #[test]
    fn close_deletes_backing_file() {
        let m = TempMapping::create(8).unwrap();
        let p = m.path.as_ref().unwrap().to_path_buf();
        assert!(p.exists());
        m.close().unwrap();
        assert!(!p.exists());
    }
}
