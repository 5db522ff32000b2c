//! Configuration file and key material loading.
//!
//! Line-oriented config file (gate name, internal device, external
//! device, hop rate), plus one `<name>.pub`/`<name>.priv` key file pair
//! per peer found alongside it. Loading is synchronous, startup-only, and
//! all-or-nothing: a malformed line or key aborts the whole load rather
//! than partially applying a config.

use std::fmt;
use std::fs;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use rsa::{BigUint, RsaPrivateKey, RsaPublicKey};

use arg_net::peer::MAX_NAME_SIZE;

#[derive(Debug)]
pub enum ConfigError {
    Io(PathBuf, std::io::Error),
    MissingLine(PathBuf, &'static str),
    NameTooLong(String),
    BadAddress(PathBuf, String),
    BadHopRate(String),
    BadKeyHex(PathBuf),
    InvalidPrivateKey(PathBuf),
    UnknownGateName(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io(path, e) => write!(f, "unable to read {}: {}", path.display(), e),
            ConfigError::MissingLine(path, what) => write!(f, "problem reading {} from {}", what, path.display()),
            ConfigError::NameTooLong(name) => write!(f, "gate name '{}' exceeds {} characters", name, MAX_NAME_SIZE - 1),
            ConfigError::BadAddress(path, line) => write!(f, "'{}' in {} is not a dotted-quad address", line, path.display()),
            ConfigError::BadHopRate(line) => write!(f, "'{}' is not a valid hop rate in milliseconds", line),
            ConfigError::BadKeyHex(path) => write!(f, "malformed hex key material in {}", path.display()),
            ConfigError::InvalidPrivateKey(path) => write!(f, "private key in {} failed its consistency check", path.display()),
            ConfigError::UnknownGateName(name) => write!(f, "gate name '{}' has no matching {}.pub file", name, name),
        }
    }
}

impl std::error::Error for ConfigError {}

impl ConfigError {
    /// Legacy negated-exit-code convention: all configuration errors map
    /// to the same `CONFIG_BAD` family the CLI negates and exits with.
    pub fn as_legacy_code(&self) -> i32 {
        -40 // ARG_CONFIG_BAD
    }
}

pub struct Config {
    pub our_gate_name: String,
    pub internal_device: String,
    pub external_device: String,
    pub hop_rate_ms: u64,
    pub dir: PathBuf,
}

pub struct PeerKeyMaterial {
    pub name: String,
    pub base_ip: Ipv4Addr,
    pub mask: Ipv4Addr,
    pub public_key: RsaPublicKey,
}

fn next_nonblank_line<'a>(lines: &mut impl Iterator<Item = &'a str>, path: &Path, what: &'static str) -> Result<&'a str, ConfigError> {
    for line in lines.by_ref() {
        let trimmed = line.trim();
        if !trimmed.is_empty() {
            return Ok(trimmed);
        }
    }
    Err(ConfigError::MissingLine(path.to_path_buf(), what))
}

fn parse_addr(path: &Path, line: &str) -> Result<Ipv4Addr, ConfigError> {
    line.parse::<Ipv4Addr>().map_err(|_| ConfigError::BadAddress(path.to_path_buf(), line.to_string()))
}

fn parse_hex_biguint(path: &Path, line: &str) -> Result<BigUint, ConfigError> {
    BigUint::parse_bytes(line.trim().as_bytes(), 16).ok_or_else(|| ConfigError::BadKeyHex(path.to_path_buf()))
}

/// Read the four ordered lines of the main configuration file: gate name,
/// internal device, external device, hop rate in milliseconds.
pub fn read_config(path: &Path) -> Result<Config, ConfigError> {
    let contents = fs::read_to_string(path).map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
    let mut lines = contents.lines();

    let gate_name = next_nonblank_line(&mut lines, path, "gate name")?.to_string();
    if gate_name.len() > MAX_NAME_SIZE - 1 {
        return Err(ConfigError::NameTooLong(gate_name));
    }
    let internal_device = next_nonblank_line(&mut lines, path, "internal device name")?.to_string();
    let external_device = next_nonblank_line(&mut lines, path, "external device name")?.to_string();
    let hop_rate_line = next_nonblank_line(&mut lines, path, "hop rate")?;
    let hop_rate_ms: u64 = hop_rate_line.parse().map_err(|_| ConfigError::BadHopRate(hop_rate_line.to_string()))?;

    let dir = path.parent().map(Path::to_path_buf).unwrap_or_else(|| PathBuf::from("."));

    Ok(Config { our_gate_name: gate_name, internal_device, external_device, hop_rate_ms, dir })
}

/// Scan `dir` for `<name>.pub` files (skipping dotfiles) and load each as
/// a peer's public key material. The gateway's own entry, matching
/// `config.our_gate_name`, is included like any other and the caller is
/// responsible for treating it specially (pairing it with the private key).
pub fn read_known_gates(dir: &Path) -> Result<Vec<PeerKeyMaterial>, ConfigError> {
    let mut gates = Vec::new();
    let entries = fs::read_dir(dir).map_err(|e| ConfigError::Io(dir.to_path_buf(), e))?;
    for entry in entries {
        let entry = entry.map_err(|e| ConfigError::Io(dir.to_path_buf(), e))?;
        let file_name = entry.file_name();
        let file_name = file_name.to_string_lossy();
        if file_name.starts_with('.') || !file_name.ends_with(".pub") {
            continue;
        }
        let name = file_name.trim_end_matches(".pub").to_string();
        if name.len() > MAX_NAME_SIZE - 1 {
            return Err(ConfigError::NameTooLong(name));
        }
        gates.push(read_public_key(dir, &name)?);
    }
    Ok(gates)
}

/// Confirm `our_gate_name` has a matching entry in `known_gates`, returning
/// that entry's own key material. The gateway's identity is derived from
/// its own `.pub` file like any peer's, so a missing entry here means the
/// config file and key directory disagree about this gateway's name.
pub fn find_own_gate<'a>(known_gates: &'a [PeerKeyMaterial], our_gate_name: &str) -> Result<&'a PeerKeyMaterial, ConfigError> {
    known_gates.iter().find(|g| g.name == our_gate_name).ok_or_else(|| ConfigError::UnknownGateName(our_gate_name.to_string()))
}

fn read_public_key(dir: &Path, name: &str) -> Result<PeerKeyMaterial, ConfigError> {
    let path = dir.join(format!("{}.pub", name));
    let contents = fs::read_to_string(&path).map_err(|e| ConfigError::Io(path.clone(), e))?;
    let mut lines = contents.lines();

    let base_ip = parse_addr(&path, next_nonblank_line(&mut lines, &path, "base IP")?)?;
    let mask = parse_addr(&path, next_nonblank_line(&mut lines, &path, "mask")?)?;
    let n = parse_hex_biguint(&path, next_nonblank_line(&mut lines, &path, "RSA modulus")?)?;
    let e = parse_hex_biguint(&path, next_nonblank_line(&mut lines, &path, "RSA exponent")?)?;

    let public_key = RsaPublicKey::new(n, e).map_err(|_| ConfigError::BadKeyHex(path.clone()))?;
    Ok(PeerKeyMaterial { name: name.to_string(), base_ip, mask, public_key })
}

/// Load this gateway's own private key, `<name>.priv` in `dir`. Only the
/// `N, E, D, P, Q` components are passed to the key constructor — the
/// remaining CRT parameters (`DP, DQ, QP`) the original format stores are
/// read for completeness but are derivable from `P, Q` and are
/// recomputed internally rather than threaded through by hand.
pub fn read_private_key(dir: &Path, name: &str) -> Result<RsaPrivateKey, ConfigError> {
    let path = dir.join(format!("{}.priv", name));
    let contents = fs::read_to_string(&path).map_err(|e| ConfigError::Io(path.clone(), e))?;
    let mut lines = contents.lines();

    let n = parse_hex_biguint(&path, next_nonblank_line(&mut lines, &path, "RSA N")?)?;
    let e = parse_hex_biguint(&path, next_nonblank_line(&mut lines, &path, "RSA E")?)?;
    let d = parse_hex_biguint(&path, next_nonblank_line(&mut lines, &path, "RSA D")?)?;
    let p = parse_hex_biguint(&path, next_nonblank_line(&mut lines, &path, "RSA P")?)?;
    let q = parse_hex_biguint(&path, next_nonblank_line(&mut lines, &path, "RSA Q")?)?;
    // DP, DQ, QP are present in the file but not needed by the key constructor.
    let _dp = parse_hex_biguint(&path, next_nonblank_line(&mut lines, &path, "RSA DP")?)?;
    let _dq = parse_hex_biguint(&path, next_nonblank_line(&mut lines, &path, "RSA DQ")?)?;
    let _qp = parse_hex_biguint(&path, next_nonblank_line(&mut lines, &path, "RSA QP")?)?;

    let key = RsaPrivateKey::from_components(n, e, d, vec![p, q]).map_err(|_| ConfigError::InvalidPrivateKey(path.clone()))?;
    key.validate().map_err(|_| ConfigError::InvalidPrivateKey(path))?;
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn reads_ordered_config_lines_and_skips_blanks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("arg.conf");
        let mut f = fs::File::create(&path).unwrap();
        writeln!(f, "gatea\n\ntun0\neth0\n\n100\n").unwrap();
        let cfg = read_config(&path).unwrap();
        assert_eq!(cfg.our_gate_name, "gatea");
        assert_eq!(cfg.internal_device, "tun0");
        assert_eq!(cfg.external_device, "eth0");
        assert_eq!(cfg.hop_rate_ms, 100);
    }

    #[test]
    fn name_too_long_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("arg.conf");
        fs::write(&path, "waytoolonggatename\ntun0\neth0\n100\n").unwrap();
        assert!(matches!(read_config(&path), Err(ConfigError::NameTooLong(_))));
    }

    #[test]
    fn reads_public_key_file() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("gateb.pub"), "10.1.0.0\n255.255.255.0\nFFFF\n10001\n").unwrap();
        let gates = read_known_gates(dir.path()).unwrap();
        assert_eq!(gates.len(), 1);
        assert_eq!(gates[0].name, "gateb");
        assert_eq!(gates[0].base_ip, Ipv4Addr::new(10, 1, 0, 0));
    }

    #[test]
    fn hidden_files_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(".hidden.pub"), "x").unwrap();
        let gates = read_known_gates(dir.path()).unwrap();
        assert!(gates.is_empty());
    }

    #[test]
    fn find_own_gate_rejects_unknown_name() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("gateb.pub"), "10.1.0.0\n255.255.255.0\nFFFF\n10001\n").unwrap();
        let gates = read_known_gates(dir.path()).unwrap();
        assert!(matches!(find_own_gate(&gates, "gatea"), Err(ConfigError::UnknownGateName(_))));
        assert!(find_own_gate(&gates, "gateb").is_ok());
    }
}
