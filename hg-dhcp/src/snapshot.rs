//! Lease database persistence: versioned JSON snapshots plus one-shot
//! migration of the legacy `leases.db` format.

use std::fs;
use std::io::Write;
use std::net::IpAddr;
use std::path::Path;

use anyhow::{bail, Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use hg_common::{HwAddr, Lease};

const SCHEMA_VERSION: u32 = 1;

/// File name of the pre-rewrite lease database inside the work directory.
pub const LEGACY_DB_NAME: &str = "leases.db";

#[derive(Debug, Serialize, Deserialize)]
struct SnapshotFile {
    version: u32,
    leases: Vec<SnapshotLease>,
}

#[derive(Debug, Serialize, Deserialize)]
struct SnapshotLease {
    mac: String,
    ip: String,
    hostname: String,
    #[serde(rename = "static")]
    is_static: bool,
    /// RFC 3339 for dynamic leases, empty for static ones.
    expires: String,
}

impl From<&Lease> for SnapshotLease {
    fn from(l: &Lease) -> Self {
        Self {
            mac: l.hwaddr.to_string(),
            ip: l.ip.to_string(),
            hostname: l.hostname.clone(),
            is_static: l.is_static,
            expires: match (l.is_static, l.expires) {
                (true, _) | (false, None) => String::new(),
                (false, Some(t)) => t.to_rfc3339_opts(SecondsFormat::Secs, true),
            },
        }
    }
}

impl SnapshotLease {
    fn into_lease(self) -> Result<Lease> {
        let hwaddr: HwAddr = self
            .mac
            .parse()
            .map_err(|e| anyhow::anyhow!("bad mac {:?}: {e}", self.mac))?;
        let ip: IpAddr = self
            .ip
            .parse()
            .with_context(|| format!("bad ip {:?}", self.ip))?;
        let expires = if self.is_static {
            None
        } else {
            let t = DateTime::parse_from_rfc3339(&self.expires)
                .with_context(|| format!("bad expiry {:?}", self.expires))?;
            Some(t.with_timezone(&Utc))
        };
        Ok(Lease {
            hwaddr,
            ip,
            hostname: self.hostname,
            expires,
            is_static: self.is_static,
        })
    }
}

/// Serialize the leases and atomically replace the snapshot file: write to
/// a temporary in the same directory, fsync, rename.
pub fn save(path: &Path, leases: &[Lease]) -> Result<()> {
    let mut entries: Vec<SnapshotLease> = leases.iter().map(SnapshotLease::from).collect();
    entries.sort_by(|a, b| a.hostname.cmp(&b.hostname));

    let file = SnapshotFile {
        version: SCHEMA_VERSION,
        leases: entries,
    };
    let data = serde_json::to_vec(&file)?;

    if let Some(dir) = path.parent() {
        if !dir.as_os_str().is_empty() {
            fs::create_dir_all(dir)
                .with_context(|| format!("creating {}", dir.display()))?;
        }
    }
    let tmp_path = path.with_extension("tmp");
    let mut tmp = fs::File::create(&tmp_path)
        .with_context(|| format!("creating {}", tmp_path.display()))?;
    tmp.write_all(&data)?;
    tmp.sync_all()?;
    drop(tmp);
    fs::rename(&tmp_path, path)
        .with_context(|| format!("renaming into {}", path.display()))?;
    Ok(())
}

/// Load the snapshot. A missing file yields an empty table; an unreadable
/// or structurally invalid file is a startup error; individual bad entries
/// are logged and skipped.
pub fn load(path: &Path) -> Result<Vec<Lease>> {
    let data = match fs::read(path) {
        Ok(d) => d,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e).with_context(|| format!("reading {}", path.display())),
    };

    let file: SnapshotFile = serde_json::from_slice(&data)
        .with_context(|| format!("parsing {}", path.display()))?;
    if file.version > SCHEMA_VERSION {
        bail!(
            "lease db {} has unsupported version {}",
            path.display(),
            file.version
        );
    }

    let mut leases = Vec::with_capacity(file.leases.len());
    for entry in file.leases {
        match entry.into_lease() {
            Ok(l) => leases.push(l),
            Err(e) => warn!("Skipping lease entry in {}: {e}", path.display()),
        }
    }
    Ok(leases)
}

#[derive(Debug, Deserialize)]
struct LegacyLease {
    mac: String,
    ip: String,
    #[serde(default)]
    host: String,
    exp: i64,
}

/// Sentinel expiry marking a static lease in the legacy format.
const LEGACY_STATIC_EXP: i64 = 1;

fn legacy_ip(raw: &[u8]) -> Option<IpAddr> {
    match raw.len() {
        4 => {
            let o: [u8; 4] = raw.try_into().ok()?;
            Some(IpAddr::from(o))
        }
        16 => {
            let o: [u8; 16] = raw.try_into().ok()?;
            Some(IpAddr::from(o))
        }
        _ => None,
    }
}

fn convert_legacy(entry: &LegacyLease) -> Option<Lease> {
    let mac_raw = BASE64.decode(&entry.mac).ok()?;
    let hwaddr = HwAddr::new(&mac_raw).ok()?;
    let ip = legacy_ip(&BASE64.decode(&entry.ip).ok()?)?;
    let is_static = entry.exp == LEGACY_STATIC_EXP;
    let expires = if is_static {
        None
    } else {
        Some(DateTime::from_timestamp(entry.exp, 0)?)
    };
    Some(Lease {
        hwaddr,
        ip,
        hostname: entry.host.clone(),
        expires,
        is_static,
    })
}

/// Convert a legacy `leases.db` next to (or configured alongside) the new
/// snapshot into the current format. Runs only when the legacy file exists
/// and the new one does not; the legacy file is deleted once converted.
/// Returns whether a migration happened.
pub fn migrate_legacy(legacy_path: &Path, new_path: &Path) -> Result<bool> {
    if new_path.exists() || !legacy_path.exists() {
        return Ok(false);
    }

    let data = fs::read(legacy_path)
        .with_context(|| format!("reading {}", legacy_path.display()))?;
    let entries: Vec<LegacyLease> = serde_json::from_slice(&data)
        .with_context(|| format!("parsing {}", legacy_path.display()))?;

    let mut leases = Vec::with_capacity(entries.len());
    for entry in &entries {
        match convert_legacy(entry) {
            Some(l) => leases.push(l),
            None => warn!(
                "Skipping unconvertible legacy lease (mac {:?}) in {}",
                entry.mac,
                legacy_path.display()
            ),
        }
    }

    save(new_path, &leases)?;
    fs::remove_file(legacy_path)
        .with_context(|| format!("deleting {}", legacy_path.display()))?;
    info!(
        "Migrated {} leases from {} to {}",
        leases.len(),
        legacy_path.display(),
        new_path.display()
    );
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("hg-dhcp-{}-{name}", std::process::id()))
    }

    fn mac(s: &str) -> HwAddr {
        s.parse().unwrap()
    }

    fn sample_leases() -> Vec<Lease> {
        vec![
            Lease {
                hwaddr: mac("aa:aa:aa:aa:aa:aa"),
                ip: "192.168.10.100".parse().unwrap(),
                hostname: "zulu".into(),
                expires: Some(DateTime::from_timestamp(1_700_000_000, 0).unwrap()),
                is_static: false,
            },
            Lease::new_static(
                mac("bb:bb:bb:bb:bb:bb"),
                "192.168.10.5".parse().unwrap(),
                "alpha".into(),
            ),
        ]
    }

    #[test]
    fn test_save_load_roundtrip() {
        let path = temp_path("roundtrip.json");
        let leases = sample_leases();
        save(&path, &leases).unwrap();

        let loaded = load(&path).unwrap();
        assert_eq!(loaded.len(), 2);
        for lease in &leases {
            assert!(loaded.contains(lease));
        }
        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_output_sorted_by_hostname() {
        let path = temp_path("sorted.json");
        save(&path, &sample_leases()).unwrap();

        let text = fs::read_to_string(&path).unwrap();
        let alpha = text.find("alpha").unwrap();
        let zulu = text.find("zulu").unwrap();
        assert!(alpha < zulu);
        assert!(text.contains("\"version\":1"));
        // static leases serialize an empty expiry
        assert!(text.contains("\"expires\":\"\""));
        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_missing_file_is_empty() {
        assert!(load(Path::new("/nonexistent/homegate/leases.json"))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_parse_error_fails_load() {
        let path = temp_path("garbage.json");
        fs::write(&path, b"{ not json").unwrap();
        assert!(load(&path).is_err());
        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_bad_entries_are_skipped() {
        let path = temp_path("badentry.json");
        fs::write(
            &path,
            br#"{"version":1,"leases":[
                {"mac":"not-a-mac","ip":"1.2.3.4","hostname":"","static":true,"expires":""},
                {"mac":"11:22:33:44:55:66","ip":"1.2.3.4","hostname":"","static":false,"expires":"not-a-time"},
                {"mac":"11:22:33:44:55:66","ip":"1.2.3.4","hostname":"ok","static":true,"expires":""}
            ]}"#,
        )
        .unwrap();
        let loaded = load(&path).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].hostname, "ok");
        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_future_version_is_rejected() {
        let path = temp_path("future.json");
        fs::write(&path, br#"{"version":9,"leases":[]}"#).unwrap();
        assert!(load(&path).is_err());
        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_legacy_migration() {
        let legacy = temp_path("legacy.db");
        let new = temp_path("migrated.json");
        let _ = fs::remove_file(&new);

        // mac 11:22:33:44:55:66 / ip 1.2.3.4 static; mac 66:55:44:33:22:11 /
        // ip 4.3.2.1 dynamic at epoch 1231231231.
        let entries = serde_json::json!([
            {"mac": BASE64.encode([0x11, 0x22, 0x33, 0x44, 0x55, 0x66]),
             "ip": BASE64.encode([1, 2, 3, 4]), "host": "test1", "exp": 1},
            {"mac": BASE64.encode([0x66, 0x55, 0x44, 0x33, 0x22, 0x11]),
             "ip": BASE64.encode([4, 3, 2, 1]), "host": "test2", "exp": 1_231_231_231i64},
        ]);
        fs::write(&legacy, serde_json::to_vec(&entries).unwrap()).unwrap();

        assert!(migrate_legacy(&legacy, &new).unwrap());
        assert!(!legacy.exists());

        let loaded = load(&new).unwrap();
        assert_eq!(loaded.len(), 2);
        let l1 = loaded.iter().find(|l| l.hostname == "test1").unwrap();
        assert!(l1.is_static);
        assert_eq!(l1.expires, None);
        let l2 = loaded.iter().find(|l| l.hostname == "test2").unwrap();
        assert!(!l2.is_static);
        assert_eq!(
            l2.expires,
            Some(DateTime::from_timestamp(1_231_231_231, 0).unwrap())
        );

        // second run is a no-op: the new file already exists
        assert!(!migrate_legacy(&legacy, &new).unwrap());
        fs::remove_file(&new).unwrap();
    }

    #[test]
    fn test_legacy_migration_absent_files() {
        let legacy = temp_path("no-legacy.db");
        let new = temp_path("no-new.json");
        let _ = fs::remove_file(&new);
        assert!(!migrate_legacy(&legacy, &new).unwrap());
    }
}
