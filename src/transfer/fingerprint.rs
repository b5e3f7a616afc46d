// 上传源文件指纹
//
// 大小 + 头部 256KB 的 MD5 + 尾部 256KB 的 MD5。
// 续传前比对指纹，源文件在暂停期间被修改时拒绝续传。

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

/// 头尾采样长度: 256KB
pub const FINGERPRINT_SAMPLE_SIZE: u64 = 256 * 1024;

/// 源文件指纹
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceFingerprint {
    pub size: u64,
    pub head_md5: String,
    pub tail_md5: String,
}

impl SourceFingerprint {
    /// 计算文件指纹（阻塞 I/O 放到 spawn_blocking 中执行）
    pub async fn compute(path: &Path) -> Result<Self> {
        let path: PathBuf = path.to_path_buf();
        tokio::task::spawn_blocking(move || Self::compute_blocking(&path))
            .await
            .context("指纹计算任务异常退出")?
    }

    fn compute_blocking(path: &Path) -> Result<Self> {
        let mut file =
            File::open(path).with_context(|| format!("打开源文件失败: {:?}", path))?;
        let size = file.metadata().context("读取源文件元数据失败")?.len();

        let head_len = size.min(FINGERPRINT_SAMPLE_SIZE);
        let head_md5 = read_md5(&mut file, 0, head_len)?;

        let tail_start = size.saturating_sub(FINGERPRINT_SAMPLE_SIZE);
        let tail_md5 = read_md5(&mut file, tail_start, size - tail_start)?;

        Ok(Self {
            size,
            head_md5,
            tail_md5,
        })
    }
}

fn read_md5(file: &mut File, offset: u64, len: u64) -> Result<String> {
    let mut buffer = vec![0u8; len as usize];
    file.seek(SeekFrom::Start(offset))
        .context("源文件定位失败")?;
    file.read_exact(&mut buffer).context("读取源文件失败")?;
    Ok(crate::remote::content_hash(&buffer))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[tokio::test]
    async fn test_fingerprint_detects_changes() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(&vec![7u8; 600 * 1024]).unwrap();
        file.flush().unwrap();

        let original = SourceFingerprint::compute(file.path()).await.unwrap();
        assert_eq!(original.size, 600 * 1024);
        assert_eq!(original, SourceFingerprint::compute(file.path()).await.unwrap());

        // 修改末尾一个字节，大小不变
        let handle = file.as_file_mut();
        handle.seek(SeekFrom::End(-1)).unwrap();
        handle.write_all(&[8u8]).unwrap();
        handle.flush().unwrap();

        let changed = SourceFingerprint::compute(file.path()).await.unwrap();
        assert_eq!(changed.size, original.size);
        assert_eq!(changed.head_md5, original.head_md5);
        assert_ne!(changed.tail_md5, original.tail_md5);
    }

    #[tokio::test]
    async fn test_small_and_empty_files() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"tiny").unwrap();
        let small = SourceFingerprint::compute(file.path()).await.unwrap();
        assert_eq!(small.head_md5, small.tail_md5);

        let empty = NamedTempFile::new().unwrap();
        let fp = SourceFingerprint::compute(empty.path()).await.unwrap();
        assert_eq!(fp.size, 0);
    }

    #[tokio::test]
    async fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(SourceFingerprint::compute(&dir.path().join("nope")).await.is_err());
    }
}
