//! File-backed subnet allocator: one JSON file per VM under
//! `<state_dir>/subnets/`, octets drawn from `192.168.[100..254].0/24`.
//!
//! Grounded on `ando-observability::audit_file_writer`'s write-then-rename
//! idiom (there: rotate-by-rename; here: write a `.tmp` file and rename it
//! into place so a crash mid-write never leaves a half-written allocation
//! file for `allocate` to trip over on the next scan), guarded by a single
//! process-level `std::sync::Mutex`.

use netguard_core::types::SubnetAllocation;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

const FIRST_OCTET: u8 = 100;
const LAST_OCTET: u8 = 254;

#[derive(thiserror::Error, Debug)]
pub enum AllocatorError {
    #[error("no available subnets")]
    Exhausted,
    #[error("no allocation for vm {0}")]
    NotFound(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

pub struct SubnetAllocator {
    dir: PathBuf,
    lock: Mutex<()>,
}

impl SubnetAllocator {
    pub fn new(state_dir: &Path) -> std::io::Result<Self> {
        let dir = state_dir.join("subnets");
        fs::create_dir_all(&dir)?;
        Ok(Self { dir, lock: Mutex::new(()) })
    }

    /// Scan existing allocation files, pick the lowest unused octet in
    /// `[100, 254]`, and persist a new allocation for `vm_id`.
    pub fn allocate(&self, vm_id: &str) -> Result<SubnetAllocation, AllocatorError> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());

        let used = self.used_octets()?;
        let octet = (FIRST_OCTET..=LAST_OCTET)
            .find(|o| !used.contains(o))
            .ok_or(AllocatorError::Exhausted)?;

        let allocation = SubnetAllocation {
            octet,
            vm_id: vm_id.to_string(),
            gateway_ip: format!("192.168.{octet}.1"),
            guest_ip: format!("192.168.{octet}.2"),
            cidr: format!("192.168.{octet}.0/24"),
        };
        self.persist(&allocation)?;
        tracing::info!(vm_id, octet, "subnet allocated");
        Ok(allocation)
    }

    pub fn release(&self, vm_id: &str) -> Result<(), AllocatorError> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let path = self.path_for(vm_id);
        if !path.exists() {
            return Err(AllocatorError::NotFound(vm_id.to_string()));
        }
        fs::remove_file(path)?;
        tracing::info!(vm_id, "subnet released");
        Ok(())
    }

    /// Remove allocations for VMs the external manager no longer knows
    /// about. `still_alive` is queried once per call under the lock, not
    /// per file, so a single scan sees a consistent snapshot.
    pub fn cleanup(&self, still_alive: impl Fn(&str) -> bool) -> Result<usize, AllocatorError> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut removed = 0;
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(vm_id) = path.file_stem().and_then(|s| s.to_str()) else { continue };
            if !still_alive(vm_id) {
                fs::remove_file(&path)?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    fn used_octets(&self) -> Result<Vec<u8>, AllocatorError> {
        let mut octets = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let contents = fs::read_to_string(&path)?;
            let allocation: SubnetAllocation = serde_json::from_str(&contents)?;
            octets.push(allocation.octet);
        }
        Ok(octets)
    }

    fn path_for(&self, vm_id: &str) -> PathBuf {
        self.dir.join(format!("{vm_id}.json"))
    }

    fn persist(&self, allocation: &SubnetAllocation) -> Result<(), AllocatorError> {
        let final_path = self.path_for(&allocation.vm_id);
        let tmp_path = self.dir.join(format!("{}.json.tmp", allocation.vm_id));
        fs::write(&tmp_path, serde_json::to_vec_pretty(allocation)?)?;
        fs::rename(&tmp_path, &final_path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("netguard-subnet-test-{name}-{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        dir
    }

    #[test]
    fn allocate_assigns_lowest_free_octet() {
        let dir = temp_dir("lowest");
        let alloc = SubnetAllocator::new(&dir).unwrap();
        let a = alloc.allocate("vm-a").unwrap();
        let b = alloc.allocate("vm-b").unwrap();
        assert_eq!(a.octet, 100);
        assert_eq!(b.octet, 101);
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn allocate_derives_ips_and_cidr_from_octet() {
        let dir = temp_dir("derive");
        let alloc = SubnetAllocator::new(&dir).unwrap();
        let a = alloc.allocate("vm-a").unwrap();
        assert_eq!(a.gateway_ip, "192.168.100.1");
        assert_eq!(a.guest_ip, "192.168.100.2");
        assert_eq!(a.cidr, "192.168.100.0/24");
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn release_frees_the_octet_for_reuse() {
        let dir = temp_dir("release");
        let alloc = SubnetAllocator::new(&dir).unwrap();
        let a = alloc.allocate("vm-a").unwrap();
        alloc.release("vm-a").unwrap();
        let b = alloc.allocate("vm-b").unwrap();
        assert_eq!(a.octet, b.octet);
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn release_unknown_vm_errors() {
        let dir = temp_dir("release-unknown");
        let alloc = SubnetAllocator::new(&dir).unwrap();
        assert!(matches!(alloc.release("ghost"), Err(AllocatorError::NotFound(_))));
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn exhaustion_returns_clear_error() {
        let dir = temp_dir("exhaust");
        let alloc = SubnetAllocator::new(&dir).unwrap();
        for i in FIRST_OCTET..=LAST_OCTET {
            alloc.allocate(&format!("vm-{i}")).unwrap();
        }
        assert!(matches!(alloc.allocate("vm-overflow"), Err(AllocatorError::Exhausted)));
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn cleanup_removes_allocations_for_dead_vms() {
        let dir = temp_dir("cleanup");
        let alloc = SubnetAllocator::new(&dir).unwrap();
        alloc.allocate("vm-keep").unwrap();
        alloc.allocate("vm-gone").unwrap();
        let removed = alloc.cleanup(|vm_id| vm_id == "vm-keep").unwrap();
        assert_eq!(removed, 1);
        assert!(alloc.release("vm-keep").is_ok());
        assert!(matches!(alloc.release("vm-gone"), Err(AllocatorError::NotFound(_))));
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn concurrent_allocate_never_duplicates_an_octet() {
        use std::sync::Arc;
        let dir = temp_dir("concurrent");
        let alloc = Arc::new(SubnetAllocator::new(&dir).unwrap());
        let handles: Vec<_> = (0..16)
            .map(|i| {
                let alloc = Arc::clone(&alloc);
                std::thread::spawn(move || alloc.allocate(&format!("vm-{i}")).unwrap())
            })
            .collect();
        let mut octets: Vec<u8> = handles.into_iter().map(|h| h.join().unwrap().octet).collect();
        octets.sort_unstable();
        let mut deduped = octets.clone();
        deduped.dedup();
        assert_eq!(octets.len(), deduped.len(), "duplicate octet allocated: {octets:?}");
        let _ = fs::remove_dir_all(&dir);
    }
}
