use std::io::Read;
use std::path::Path;
use std::sync::{Condvar, Mutex};
use std::time::SystemTime;

use md5::Md5;
use sha2::{Digest, Sha256};

pub fn file_loader<P: AsRef<Path>>(path: P) -> std::io::Result<Vec<u8>> {
    std::fs::read(path)
}

/// Best-effort write; the caller only cares about success, not why it
/// failed. Creates parent directories.
pub fn file_writer<P: AsRef<Path>>(path: P, data: &[u8]) -> bool {
    if let Some(dir) = path.as_ref().parent() {
        if !dir.as_os_str().is_empty() && std::fs::create_dir_all(dir).is_err() {
            return false;
        }
    }
    std::fs::write(path, data).is_ok()
}

pub fn crc32c_hash(data: &[u8]) -> u32 {
    crc32c::crc32c(data)
}

pub fn sha256_hex(data: &[u8]) -> String {
    let digest = Sha256::digest(data);
    base16ct::lower::encode_string(&digest)
}

pub fn md5_hex(data: &[u8]) -> String {
    let digest = Md5::digest(data);
    base16ct::lower::encode_string(&digest)
}

fn hash_file<D: Digest>(path: &Path) -> std::io::Result<Vec<u8>> {
    let mut f = std::fs::File::open(path)?;
    let mut hasher = D::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = f.read(&mut buf)?;
        if n == 0 {
            break;
        }
        Digest::update(&mut hasher, &buf[..n]);
    }
    Ok(hasher.finalize().to_vec())
}

pub fn file_sha256_hex<P: AsRef<Path>>(path: P) -> std::io::Result<String> {
    Ok(base16ct::lower::encode_string(&hash_file::<Sha256>(path.as_ref())?))
}

pub fn file_md5_hex<P: AsRef<Path>>(path: P) -> std::io::Result<String> {
    Ok(base16ct::lower::encode_string(&hash_file::<Md5>(path.as_ref())?))
}

/// RFC 1123 date for `If-Modified-Since`.
pub fn http_date(t: SystemTime) -> String {
    let dt: chrono::DateTime<chrono::Utc> = t.into();
    dt.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// Counting semaphore for bounding concurrent self-fetches. The async side
/// of the pack uses tokio's; the request path here is fully blocking.
pub struct Semaphore {
    permits: Mutex<usize>,
    cv: Condvar,
}

pub struct SemaphoreGuard<'a>(&'a Semaphore);

impl Semaphore {
    pub fn new(permits: usize) -> Self {
        Semaphore { permits: Mutex::new(permits), cv: Condvar::new() }
    }

    pub fn acquire(&self) -> SemaphoreGuard<'_> {
        let mut p = self.permits.lock().unwrap();
        while *p == 0 {
            p = self.cv.wait(p).unwrap();
        }
        *p -= 1;
        SemaphoreGuard(self)
    }
}

impl Drop for SemaphoreGuard<'_> {
    fn drop(&mut self) {
        *self.0.permits.lock().unwrap() += 1;
        self.0.cv.notify_one();
    }
}

pub mod numa {
    /// NUMA node of the current CPU. On x86-64 the node id is carried in
    /// IA32_TSC_AUX, readable from userspace with `rdtscp`.
    pub fn current_node() -> usize {
        #[cfg(target_arch = "x86_64")]
        {
            if is_x86_feature_detected!("rdtscp") {
                let mut aux: u32 = 0;
                unsafe {
                    core::arch::x86_64::__rdtscp(&mut aux);
                }
                return (aux >> 12) as usize;
            }
            0
        }
        #[cfg(not(target_arch = "x86_64"))]
        {
            0
        }
    }

    /// Number of populated NUMA nodes, from sysfs; 1 when unknown.
    pub fn node_count() -> usize {
        let mut count = 0usize;
        if let Ok(rd) = std::fs::read_dir("/sys/devices/system/node") {
            for e in rd.flatten() {
                let name = e.file_name();
                let name = name.to_string_lossy();
                if name.starts_with("node") && name[4..].chars().all(|c| c.is_ascii_digit()) {
                    count += 1;
                }
            }
        }
        count.max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hashes_are_stable() {
        assert_eq!(sha256_hex(b"abc"), "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad");
        assert_eq!(md5_hex(b"abc"), "900150983cd24fb0d6963f7d28e17f72");
        // CRC32-C ("iSCSI" polynomial), not the ISO CRC32
        assert_eq!(crc32c_hash(b"123456789"), 0xe3069283);
    }

    #[test]
    fn semaphore_limits() {
        let s = Semaphore::new(2);
        let a = s.acquire();
        let b = s.acquire();
        drop(a);
        let _c = s.acquire();
        drop(b);
    }

    #[test]
    fn numa_sane() {
        assert!(numa::node_count() >= 1);
        let _ = numa::current_node();
    }
}
