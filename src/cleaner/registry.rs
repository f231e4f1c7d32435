use std::process::Command;

use log::{debug, info, warn};

use super::platform::Platform;

const HIVES: &[(&str, &str)] = &[
    ("HKCR", "HKEY_CLASSES_ROOT"),
    ("HKCU", "HKEY_CURRENT_USER"),
    ("HKLM", "HKEY_LOCAL_MACHINE"),
    ("HKU", "HKEY_USERS"),
    ("HKCC", "HKEY_CURRENT_CONFIG"),
];

/// Splits `HKCU\Software\X` into the short hive name and the subkey.
pub fn split_key(full_key: &str) -> Option<(&'static str, &str)> {
    let (hive, subkey) = full_key.split_once('\\').unwrap_or((full_key, ""));
    let short = HIVES.iter().find_map(|(short, long)| {
        if hive.eq_ignore_ascii_case(short) || hive.eq_ignore_ascii_case(long) {
            Some(*short)
        } else {
            None
        }
    })?;
    if subkey.trim_matches('\\').is_empty() {
        // Never a whole hive
        return None;
    }
    Some((short, subkey.trim_matches('\\')))
}

/// Deletes a key and its subtree. Returns whether anything was removed.
pub fn delete_key(platform: &Platform, full_key: &str) -> bool {
    let (hive, subkey) = match split_key(full_key) {
        Some(parts) => parts,
        None => {
            warn!("Refusing malformed registry key: {}", full_key);
            return false;
        }
    };
    if !platform.is_windows() {
        debug!("Registry key {} ignored on {:?}", full_key, platform);
        return false;
    }
    let target = format!("{}\\{}", hive, subkey);
    run_reg(&["delete", &target, "/f"], full_key)
}

pub fn delete_value(platform: &Platform, full_key: &str, value: &str) -> bool {
    let (hive, subkey) = match split_key(full_key) {
        Some(parts) => parts,
        None => {
            warn!("Refusing malformed registry key: {}", full_key);
            return false;
        }
    };
    if !platform.is_windows() {
        debug!("Registry value {}\\{} ignored on {:?}", full_key, value, platform);
        return false;
    }
    let target = format!("{}\\{}", hive, subkey);
    run_reg(&["delete", &target, "/v", value, "/f"], full_key)
}

fn run_reg(args: &[&str], label: &str) -> bool {
    match Command::new("reg.exe").args(args).output() {
        Ok(output) if output.status.success() => {
            info!("Deleted registry entry {}", label);
            true
        }
        Ok(output) => {
            // reg.exe exits 1 for missing keys as well as for access errors
            debug!(
                "reg.exe delete {} failed (status: {:?}): {}",
                label,
                output.status.code(),
                String::from_utf8_lossy(&output.stderr).trim()
            );
            false
        }
        Err(e) => {
            warn!("Failed to run reg.exe: {}", e);
            false
        }
    }
}
