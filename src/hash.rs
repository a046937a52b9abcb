//! 秒传相关的哈希计算：预哈希、完整内容哈希、持有证明

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use md5::Md5;
use sha1::{Digest, Sha1};

/// 超过该大小的文件先做预哈希检测
pub const PRE_HASH_THRESHOLD: u64 = 100 * 1024 * 1024;

/// 预哈希读取的字节数
pub const PRE_HASH_SIZE: usize = 1024;

/// 空文件的 SHA1
pub const EMPTY_CONTENT_HASH: &str = "DA39A3EE5E6B4B0D3255BFEF95601890AFD80709";

/// 内容哈希算法名
pub const CONTENT_HASH_NAME: &str = "sha1";

pub const PROOF_VERSION: &str = "v1";

/// 单个文件最多的分片数
pub const MAX_PART_COUNT: u64 = 10_000;

/// 文件头部 1KB 的 SHA1
pub fn pre_hash(path: &Path) -> std::io::Result<String> {
    let mut file = File::open(path)?;
    let mut buffer = Vec::with_capacity(PRE_HASH_SIZE);
    file.by_ref()
        .take(PRE_HASH_SIZE as u64)
        .read_to_end(&mut buffer)?;

    Ok(hex::encode_upper(Sha1::digest(&buffer)))
}

/// 完整文件的 SHA1
pub fn content_hash(path: &Path) -> std::io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha1::new();
    let mut buf = vec![0u8; 256 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    Ok(hex::encode_upper(hasher.finalize()))
}

/// 持有证明
///
/// 以访问令牌 MD5 的前 16 位十六进制作为偏移种子，对文件大小取模，
/// 取该位置起最多 8 个字节做 base64。空文件返回空串。
pub fn proof_code(access_token: &str, path: &Path, size: u64) -> std::io::Result<String> {
    if size == 0 {
        return Ok(String::new());
    }

    let digest = hex::encode(Md5::digest(access_token.as_bytes()));
    let seed = u64::from_str_radix(&digest[..16], 16)
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err))?;

    let start = seed % size;
    let end = (start + 8).min(size);
    let mut buffer = vec![0u8; (end - start) as usize];

    let mut file = File::open(path)?;
    file.seek(SeekFrom::Start(start))?;
    file.read_exact(&mut buffer)?;

    Ok(STANDARD.encode(buffer))
}

/// 按文件大小调整分片大小，保证分片数不超过上限
pub fn resize_block_size(file_size: u64, block_size: u64) -> u64 {
    if file_size <= block_size.saturating_mul(MAX_PART_COUNT) {
        return block_size;
    }

    let resized = file_size.div_ceil(MAX_PART_COUNT);
    resized.div_ceil(1024) * 1024
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn temp_file(content: &[u8]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn test_empty_hash_constant() {
        let file = temp_file(b"");
        assert_eq!(content_hash(file.path()).unwrap(), EMPTY_CONTENT_HASH);
    }

    #[test]
    fn test_content_hash() {
        let file = temp_file(b"hello world");
        assert_eq!(
            content_hash(file.path()).unwrap(),
            "2AAE6C35C94FCFB415DBE95F408B9CE91EE846ED"
        );
    }

    #[test]
    fn test_pre_hash_only_reads_head() {
        let mut head = vec![7u8; PRE_HASH_SIZE];
        let a = temp_file(&head);
        head.extend_from_slice(b"tail that differs");
        let b = temp_file(&head);

        assert_eq!(pre_hash(a.path()).unwrap(), pre_hash(b.path()).unwrap());
        assert_ne!(content_hash(a.path()).unwrap(), content_hash(b.path()).unwrap());
    }

    #[test]
    fn test_proof_code() {
        let content: Vec<u8> = (0..=255u8).collect();
        let file = temp_file(&content);

        let proof = proof_code("token", file.path(), content.len() as u64).unwrap();
        let decoded = STANDARD.decode(&proof).unwrap();
        assert!(!decoded.is_empty() && decoded.len() <= 8);

        // 同一令牌结果稳定
        let again = proof_code("token", file.path(), content.len() as u64).unwrap();
        assert_eq!(proof, again);

        let empty = temp_file(b"");
        assert_eq!(proof_code("token", empty.path(), 0).unwrap(), "");
    }

    #[test]
    fn test_proof_code_offset() {
        let content: Vec<u8> = (0..100u8).collect();
        let file = temp_file(&content);

        let digest = hex::encode(Md5::digest(b"abc"));
        let seed = u64::from_str_radix(&digest[..16], 16).unwrap();
        let start = (seed % 100) as usize;
        let end = (start + 8).min(100);

        let proof = proof_code("abc", file.path(), 100).unwrap();
        assert_eq!(STANDARD.decode(proof).unwrap(), content[start..end].to_vec());
    }

    #[test]
    fn test_resize_block_size() {
        let block = 10 * 1024 * 1024;
        assert_eq!(resize_block_size(50 * 1024 * 1024, block), block);
        assert_eq!(resize_block_size(block * MAX_PART_COUNT, block), block);

        let huge = block * MAX_PART_COUNT + 1;
        let resized = resize_block_size(huge, block);
        assert!(resized > block);
        assert_eq!(resized % 1024, 0);
        assert!(huge.div_ceil(resized) <= MAX_PART_COUNT);
    }
}
