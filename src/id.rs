//! VM identifiers and names derived from them.

/// Prefix for VM identifiers.
pub const VM_ID_PREFIX: &str = "vm-";

/// Prefix for TAP device names.
pub const TAP_PREFIX: &str = "fc-";

/// Generate a fresh VM ID: `vm-` + 8 hex chars.
pub fn generate_vm_id() -> String {
    let mut bytes = [0u8; 4];
    // ID collisions are caught by the primary key on registration; this
    // only has to be unpredictable enough to avoid races between hosts.
    getrandom::fill(&mut bytes).expect("system entropy unavailable");
    let mut id = String::with_capacity(VM_ID_PREFIX.len() + 8);
    id.push_str(VM_ID_PREFIX);
    for b in bytes {
        id.push_str(&format!("{:02x}", b));
    }
    id
}

/// Derive the TAP device name for a VM: `fc-` + the first 8 characters of
/// the ID suffix. Short suffixes are padded from an FNV-1a hash of the full
/// ID so the name is stable and stays under IFNAMSIZ.
pub fn tap_name_for(vm_id: &str) -> String {
    let suffix = vm_id.strip_prefix(VM_ID_PREFIX).unwrap_or(vm_id);
    let mut name_part: String = suffix.chars().take(8).collect();
    if name_part.len() < 8 {
        let digest = format!("{:08x}", fnv1a(vm_id.as_bytes()));
        let needed = 8 - name_part.len();
        name_part.push_str(&digest[..needed]);
    }
    format!("{}{}", TAP_PREFIX, name_part)
}

/// 32-bit FNV-1a.
fn fnv1a(data: &[u8]) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for &b in data {
        hash ^= b as u32;
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

/// RFC 3339 timestamp with nanoseconds, UTC, for persisted rows.
pub fn now_rfc3339() -> String {
    humantime::format_rfc3339_nanos(std::time::SystemTime::now()).to_string()
}
