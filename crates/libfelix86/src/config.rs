//! Emulator configuration.
//!
//! Every tunable is declared once in the [`config_schema!`] invocation at
//! the bottom of this file; the TOML reader and writer, the environment
//! variable loader, the profile machinery and the cross-execve snapshot are
//! all plain loops over that table. Adding an option means adding a row.

use std::collections::HashMap;
use std::env;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use anyhow::{bail, Context, Result};
use nix::unistd::{Gid, Uid};
use once_cell::sync::{Lazy, OnceCell};

/// Variable carrying the hex encoded snapshot across execve.
pub const CONFIG_ENV: &str = "__FELIX86_CONFIG";
/// Variable selecting a profile by name or absolute path.
pub const PROFILE_ENV: &str = "FELIX86_PROFILE";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Bool,
    U64,
    Str,
    Path,
}

/// Type erased field value, used by every schema-driven projection.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Bool(bool),
    U64(u64),
    Str(String),
    Path(PathBuf),
}

/// One row of the schema table.
#[derive(Debug)]
pub struct Field {
    pub group: &'static str,
    pub name: &'static str,
    pub kind: FieldKind,
    pub env: &'static str,
    pub description: &'static str,
    pub required: bool,
}

macro_rules! schema_field_ty {
    (Bool) => { bool };
    (U64) => { u64 };
    (Str) => { String };
    (Path) => { PathBuf };
}

macro_rules! schema_default {
    (Bool, $default:expr) => {
        $default
    };
    (U64, $default:expr) => {
        $default
    };
    (Str, $default:expr) => {
        String::from($default)
    };
    (Path, $default:expr) => {
        PathBuf::from($default)
    };
}

macro_rules! schema_value {
    (Bool, $slot:expr) => {
        Value::Bool($slot)
    };
    (U64, $slot:expr) => {
        Value::U64($slot)
    };
    (Str, $slot:expr) => {
        Value::Str($slot.clone())
    };
    (Path, $slot:expr) => {
        Value::Path($slot.clone())
    };
}

macro_rules! schema_assign {
    (Bool, $slot:expr, $value:expr) => {
        match $value {
            Value::Bool(x) => $slot = x,
            other => unreachable!("bool field assigned {other:?}"),
        }
    };
    (U64, $slot:expr, $value:expr) => {
        match $value {
            Value::U64(x) => $slot = x,
            other => unreachable!("u64 field assigned {other:?}"),
        }
    };
    (Str, $slot:expr, $value:expr) => {
        match $value {
            Value::Str(x) => $slot = x,
            other => unreachable!("string field assigned {other:?}"),
        }
    };
    (Path, $slot:expr, $value:expr) => {
        match $value {
            Value::Path(x) => $slot = x,
            other => unreachable!("path field assigned {other:?}"),
        }
    };
}

macro_rules! config_schema {
    ($(($group:ident, $kind:ident, $name:ident, $default:expr, $env:ident, $desc:expr, $required:expr)),+ $(,)?) => {
        #[derive(Debug, Clone, PartialEq)]
        pub struct Config {
            $(pub $name: schema_field_ty!($kind),)+
            /// Where this configuration was loaded from.
            pub config_path: PathBuf,
            /// Newline separated `ENV_NAME=value` pairs for every field that
            /// differs from its default. One of the channels through which
            /// child emulators inherit state.
            pub environment: String,
        }

        impl Default for Config {
            fn default() -> Self {
                Config {
                    $($name: schema_default!($kind, $default),)+
                    config_path: PathBuf::new(),
                    environment: String::new(),
                }
            }
        }

        /// The schema table, in declaration order.
        pub static SCHEMA: &[Field] = &[
            $(Field {
                group: stringify!($group),
                name: stringify!($name),
                kind: FieldKind::$kind,
                env: stringify!($env),
                description: $desc,
                required: $required,
            },)+
        ];

        impl Config {
            pub fn get(&self, name: &str) -> Value {
                match name {
                    $(stringify!($name) => schema_value!($kind, self.$name),)+
                    _ => unreachable!("unknown config field {name}"),
                }
            }

            pub fn set(&mut self, name: &str, value: Value) {
                match name {
                    $(stringify!($name) => schema_assign!($kind, self.$name, value),)+
                    _ => unreachable!("unknown config field {name}"),
                }
            }
        }
    };
}

config_schema! {
    (paths, Path, rootfs_path, "", FELIX86_ROOTFS, "Directory containing the guest x86-64 root filesystem", true),
    (paths, Path, thunks_path, "", FELIX86_THUNKS_PATH, "Directory containing host-native thunk libraries", false),
    (general, Bool, quiet, false, FELIX86_QUIET, "Silence every message below warning severity", false),
    (general, Bool, verbose, false, FELIX86_VERBOSE, "Log verbosely, including block translation events", false),
    (general, Bool, dump_seccomp, false, FELIX86_DUMP_SECCOMP, "Print seccomp BPF programs as they are installed", false),
    (general, U64, block_limit, 0, FELIX86_BLOCK_LIMIT, "Maximum guest instructions per translated block, 0 means unlimited", false),
    (emulation, Bool, strict_memory_ordering, false, FELIX86_STRICT_MEMORY_ORDERING, "Emit fences to preserve the guest's total store order", false),
    (emulation, Bool, always_flags, false, FELIX86_ALWAYS_FLAGS, "Compute the full flags state after every instruction", false),
    (emulation, Bool, align_checks, false, FELIX86_ALIGN_CHECKS, "Verify natural alignment on vector loads and stores", false),
    (optimizations, Bool, block_linking, true, FELIX86_BLOCK_LINKING, "Patch direct branches between translated blocks", false),
    (optimizations, Bool, inline_syscalls, false, FELIX86_INLINE_SYSCALLS, "Inline the syscall dispatch stub into translated blocks", false),
    (optimizations, Bool, unsafe_flags, false, FELIX86_UNSAFE_FLAGS, "Skip flags computation when the following block overwrites it", false),
    (thunks, Str, enabled_thunks, "", FELIX86_ENABLED_THUNKS, "Comma separated guest libraries replaced by host thunks", false),
    (environment, Str, extra_env, "", FELIX86_EXTRA_ENV, "Semicolon separated KEY=value pairs appended to the guest environment", false),
}

static CURRENT: Lazy<RwLock<Config>> = Lazy::new(|| RwLock::new(Config::default()));
static INITIAL: OnceCell<Config> = OnceCell::new();

/// The live configuration. May change on profile switches; callers must not
/// cache fields across syscall boundaries.
pub fn current() -> RwLockReadGuard<'static, Config> {
    CURRENT.read().expect("config lock poisoned")
}

pub fn current_mut() -> RwLockWriteGuard<'static, Config> {
    CURRENT.write().expect("config lock poisoned")
}

/// The snapshot taken right after startup. This is the authoritative
/// cross-execve payload and never changes afterwards.
pub fn initial() -> &'static Config {
    INITIAL
        .get()
        .expect("configuration accessed before initialization")
}

fn set_globals(config: Config) {
    *CURRENT.write().expect("config lock poisoned") = config.clone();
    if INITIAL.set(config).is_err() {
        tracing::warn!("initial configuration already recorded, keeping the first snapshot");
    }
}

/// Truthiness of environment variable text.
pub fn is_truthy(text: &str) -> bool {
    matches!(
        text.to_lowercase().as_str(),
        "true" | "1" | "yes" | "on" | "y" | "enable"
    )
}

/// Integers in the environment are decimal or 0x-prefixed hexadecimal.
pub fn parse_integer(text: &str) -> Result<u64> {
    let parsed = match text.strip_prefix("0x") {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => text.parse(),
    };
    parsed.with_context(|| format!("failed to parse integer: {text:?}"))
}

fn value_from_env(kind: FieldKind, text: &str) -> Result<Value> {
    Ok(match kind {
        FieldKind::Bool => Value::Bool(is_truthy(text)),
        FieldKind::U64 => Value::U64(parse_integer(text)?),
        FieldKind::Str => Value::Str(text.to_string()),
        FieldKind::Path => Value::Path(PathBuf::from(text)),
    })
}

fn value_from_toml(kind: FieldKind, value: &toml::Value) -> Option<Value> {
    match kind {
        FieldKind::Bool => value.as_bool().map(Value::Bool),
        FieldKind::U64 => value.as_integer().map(|i| Value::U64(i as u64)),
        FieldKind::Str => value.as_str().map(|s| Value::Str(s.to_string())),
        FieldKind::Path => value.as_str().map(|s| Value::Path(PathBuf::from(s))),
    }
}

/// Stringification used for the `environment` buffer: booleans spelled out,
/// integers 0x-hexadecimal, text verbatim.
fn stringify_env(value: &Value) -> String {
    match value {
        Value::Bool(b) => if *b { "true" } else { "false" }.to_string(),
        Value::U64(i) => format!("{i:#x}"),
        Value::Str(s) => s.clone(),
        Value::Path(p) => p.display().to_string(),
    }
}

/// Stringification used for the cross-execve snapshot: booleans as 1/0,
/// integers decimal. Both spellings parse back through the environment
/// rules, which is what the consumer uses.
fn stringify_snapshot(value: &Value) -> String {
    match value {
        Value::Bool(b) => if *b { "1" } else { "0" }.to_string(),
        Value::U64(i) => i.to_string(),
        Value::Str(s) => s.clone(),
        Value::Path(p) => p.display().to_string(),
    }
}

fn kind_name(kind: FieldKind) -> &'static str {
    match kind {
        FieldKind::Bool => "bool",
        FieldKind::U64 => "u64",
        FieldKind::Str => "string",
        FieldKind::Path => "path",
    }
}

fn toml_literal(value: &Value) -> String {
    match value {
        Value::Bool(b) => b.to_string(),
        Value::U64(i) => i.to_string(),
        Value::Str(s) => toml::Value::String(s.clone()).to_string(),
        Value::Path(p) => toml::Value::String(p.display().to_string()).to_string(),
    }
}

const HEX_DIGITS: &[u8; 16] = b"0123456789ABCDEF";

pub fn hex_encode(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len() * 2);
    for byte in data {
        out.push(HEX_DIGITS[(byte >> 4) as usize] as char);
        out.push(HEX_DIGITS[(byte & 15) as usize] as char);
    }
    out
}

pub fn hex_decode(hex: &str) -> Result<Vec<u8>> {
    if hex.len() % 2 != 0 {
        bail!("hex string has odd length: {}", hex.len());
    }
    let digit = |c: u8| -> Result<u8> {
        match c {
            b'0'..=b'9' => Ok(c - b'0'),
            b'a'..=b'f' => Ok(c - b'a' + 10),
            b'A'..=b'F' => Ok(c - b'A' + 10),
            _ => bail!("bad hex digit: {:?}", c as char),
        }
    };
    let bytes = hex.as_bytes();
    let mut out = Vec::with_capacity(bytes.len() / 2);
    for pair in bytes.chunks(2) {
        out.push(digit(pair[0])? << 4 | digit(pair[1])?);
    }
    Ok(out)
}

impl Config {
    /// Rebuilds the `environment` buffer from every field that differs from
    /// its default.
    fn rebuild_environment(&mut self) {
        let defaults = Config::default();
        let mut buffer = String::new();
        for field in SCHEMA {
            let value = self.get(field.name);
            if value != defaults.get(field.name) {
                buffer.push('\n');
                buffer.push_str(field.env);
                buffer.push('=');
                buffer.push_str(&stringify_env(&value));
            }
        }
        self.environment = buffer;
    }
}

fn ensure_dir(path: &Path) -> Result<()> {
    if path.exists() {
        if !path.is_dir() {
            bail!("{} exists but is not a directory", path.display());
        }
        return Ok(());
    }
    fs::create_dir(path).with_context(|| format!("failed to create directory {}", path.display()))
}

/// Resolves `~/.config/felix86`, creating it if needed. `SUDO_HOME` wins
/// over `HOME` so that a sudo'ed emulator keeps using the invoking user's
/// configuration.
pub fn config_dir() -> Result<PathBuf> {
    let home = env::var_os("SUDO_HOME")
        .or_else(|| env::var_os("HOME"))
        .context("neither SUDO_HOME nor HOME is set, cannot locate the configuration directory")?;

    let config = PathBuf::from(home).join(".config");
    ensure_dir(&config)?;
    let dir = config.join("felix86");
    ensure_dir(&dir)?;
    Ok(dir)
}

/// Loads a configuration from `path`, with environment variables taking
/// precedence over the file unless `ignore_env` is set.
pub fn load(path: &Path, ignore_env: bool) -> Result<Config> {
    let tree: Option<toml::Value> = match fs::read_to_string(path) {
        Ok(text) => match text.parse() {
            Ok(value) => Some(value),
            Err(err) => {
                tracing::warn!("failed to parse {}: {err}", path.display());
                None
            }
        },
        Err(err) => {
            tracing::warn!("failed to read {}: {err}", path.display());
            None
        }
    };

    let mut config = Config::default();
    for field in SCHEMA {
        let env_text = if ignore_env {
            None
        } else {
            env::var(field.env).ok()
        };

        let mut loaded = false;
        if let Some(text) = env_text {
            let value = value_from_env(field.kind, &text)
                .with_context(|| format!("bad value in environment variable {}", field.env))?;
            config.set(field.name, value);
            loaded = true;
        } else if let Some(tree) = &tree {
            let toml_field = tree.get(field.group).and_then(|group| group.get(field.name));
            if let Some(value) = toml_field.and_then(|v| value_from_toml(field.kind, v)) {
                config.set(field.name, value);
                loaded = true;
            }
        }

        if !loaded && field.required {
            bail!(
                "a value for {} is required but was not set; set the {} environment variable \
                 or [{}].{} in the configuration file {}",
                field.name,
                field.env,
                field.group,
                field.name,
                path.display()
            );
        }
    }

    config.config_path = path.to_path_buf();
    config.rebuild_environment();
    Ok(config)
}

fn write_toml(path: &Path, config: &Config, only_changed: bool) -> Result<()> {
    let defaults = Config::default();
    let mut out = String::new();
    out.push_str("# Autogenerated TOML configuration file for felix86\n");
    out.push_str("# You may change any values here, or their respective environment variable\n");
    out.push_str("# The environment variables override the values here\n");

    let mut groups: Vec<&str> = Vec::new();
    for field in SCHEMA {
        if !groups.contains(&field.group) {
            groups.push(field.group);
        }
    }

    for group in groups {
        let fields: Vec<&Field> = SCHEMA
            .iter()
            .filter(|f| {
                f.group == group && (!only_changed || config.get(f.name) != defaults.get(f.name))
            })
            .collect();
        if fields.is_empty() {
            continue;
        }
        out.push_str(&format!("\n[{group}]\n"));
        for field in fields {
            out.push_str(&format!("# {} ({})\n", field.name, kind_name(field.kind)));
            out.push_str(&format!("# Description: {}\n", field.description));
            out.push_str(&format!("# Environment variable: {}\n", field.env));
            out.push_str(&format!(
                "{} = {}\n",
                field.name,
                toml_literal(&config.get(field.name))
            ));
        }
    }

    fs::write(path, out).with_context(|| format!("failed to write {}", path.display()))
}

/// Writes every field, commented with its type, description and env var.
pub fn save(path: &Path, config: &Config) -> Result<()> {
    write_toml(path, config, false)
}

/// Writes only the fields that differ from the defaults. This is the format
/// profiles use, so loading one overlays exactly what it changes.
pub fn save_profile(path: &Path, config: &Config) -> Result<()> {
    write_toml(path, config, true)
}

type Preset = (&'static str, fn(&mut Config));

const PRESETS: [Preset; 4] = [
    ("safe", |c| {
        c.block_linking = false;
        c.inline_syscalls = false;
        c.unsafe_flags = false;
        c.strict_memory_ordering = true;
    }),
    ("extreme", |c| {
        c.inline_syscalls = true;
        c.unsafe_flags = true;
    }),
    ("paranoid", |c| {
        c.block_linking = false;
        c.inline_syscalls = false;
        c.unsafe_flags = false;
        c.always_flags = true;
        c.align_checks = true;
    }),
    ("zink", |c| {
        c.enabled_thunks = "libvulkan.so.1,libwayland-client.so.0".to_string();
        c.extra_env = "MESA_LOADER_DRIVER_OVERRIDE=zink;GALLIUM_DRIVER=zink".to_string();
    }),
];

/// Writes the preset profiles under `config_dir/profiles/`, leaving any
/// existing file alone.
pub fn write_default_profiles(config_dir: &Path) -> Result<()> {
    let profiles = config_dir.join("profiles");
    fs::create_dir_all(&profiles)
        .with_context(|| format!("failed to create {}", profiles.display()))?;

    for (name, build) in PRESETS {
        let path = profiles.join(format!("{name}.toml"));
        if path.exists() {
            continue;
        }
        let mut config = Config::default();
        build(&mut config);
        save_profile(&path, &config)?;
    }
    Ok(())
}

/// Overlays the fields present in the selected profile onto `config`. The
/// selector is an absolute path, or a name looked up (lowercased) under
/// `config_dir/profiles/`.
pub fn apply_profile(config: &mut Config, selector: &str, config_dir: &Path) -> Result<()> {
    let path = if selector.starts_with('/') {
        PathBuf::from(selector)
    } else {
        config_dir
            .join("profiles")
            .join(format!("{}.toml", selector.to_lowercase()))
    };

    let text = fs::read_to_string(&path)
        .with_context(|| format!("failed to read profile {}", path.display()))?;
    let tree: toml::Value = text
        .parse()
        .with_context(|| format!("failed to parse profile {}", path.display()))?;

    for field in SCHEMA {
        let toml_field = tree.get(field.group).and_then(|group| group.get(field.name));
        if let Some(value) = toml_field.and_then(|v| value_from_toml(field.kind, v)) {
            config.set(field.name, value);
        }
    }
    config.rebuild_environment();
    Ok(())
}

/// Chown a config file that was created while running under sudo back to
/// the invoking user, so later unprivileged runs can still edit it.
fn fixup_root_owned(path: &Path) {
    if !Uid::effective().is_root() {
        return;
    }

    let owner_changed = match (env::var("SUDO_UID").ok(), env::var("SUDO_GID").ok()) {
        (Some(uid), Some(gid)) => match (uid.parse::<u32>(), gid.parse::<u32>()) {
            (Ok(uid), Ok(gid)) if uid != 0 && gid != 0 => nix::unistd::chown(
                path,
                Some(Uid::from_raw(uid)),
                Some(Gid::from_raw(gid)),
            )
            .is_ok(),
            _ => false,
        },
        _ => false,
    };

    if !owner_changed {
        tracing::warn!(
            "the created configuration file {} may be owned by root, which may not be intended",
            path.display()
        );
        tracing::warn!(
            "you can change that manually with `sudo chown $USER:$USER {}`",
            path.display()
        );
    }
}

/// Startup initialization for the first emulator in a chain: reads (or
/// creates) the configuration file, applies the environment and the
/// selected profile, and publishes the `current`/`initial` pair.
pub fn initialize(ignore_env: bool) -> Result<()> {
    let dir = config_dir()?;
    let path = dir.join("config.toml");

    if !path.exists() {
        save(&path, &Config::default())?;
        tracing::info!("created configuration file {}", path.display());
        fixup_root_owned(&path);
    }
    write_default_profiles(&dir)?;

    let mut config = load(&path, ignore_env)?;
    if let Ok(selector) = env::var(PROFILE_ENV) {
        apply_profile(&mut config, &selector, &dir)?;
    }

    set_globals(config);
    Ok(())
}

/// The cross-execve snapshot of the initial configuration: one
/// `ENV_NAME=value` line per schema field, hex encoded.
pub fn config_hex() -> String {
    hex_for(initial())
}

fn hex_for(config: &Config) -> String {
    let mut text = String::new();
    for field in SCHEMA {
        text.push_str(field.env);
        text.push('=');
        text.push_str(&stringify_snapshot(&config.get(field.name)));
        text.push('\n');
    }
    hex_encode(text.trim_end_matches('\n').as_bytes())
}

fn child_config_from_hex(hex: &str) -> Result<Config> {
    if hex.is_empty() {
        bail!("config hex string is empty");
    }
    let bytes = hex_decode(hex).context("config hex string is bad")?;
    let text = String::from_utf8(bytes).context("config snapshot is not valid UTF-8")?;

    let mut entries = HashMap::new();
    for line in text.split('\n') {
        let (name, value) = line
            .split_once('=')
            .with_context(|| format!("malformed config snapshot line: {line:?}"))?;
        entries.insert(name, value);
    }

    let mut config = Config::default();
    for field in SCHEMA {
        let text = entries
            .get(field.env)
            .with_context(|| format!("missing option {} in inherited configuration", field.env))?;
        config.set(field.name, value_from_env(field.kind, text)?);
    }
    config.rebuild_environment();
    Ok(config)
}

/// Startup initialization for a child emulator spawned across execve. The
/// parent's snapshot replaces file and environment loading entirely; a
/// missing or damaged snapshot is fatal for the caller.
pub fn initialize_child() -> Result<()> {
    let hex = env::var(CONFIG_ENV)
        .with_context(|| format!("{CONFIG_ENV} from parent is not set"))?;
    let config = child_config_from_hex(&hex)?;
    set_globals(config);
    Ok(())
}

fn add_trusted_path_in(config_dir: &Path, path: &Path) -> Result<()> {
    let file = config_dir.join("trusted.txt");
    let existing = fs::read_to_string(&file).unwrap_or_default();
    if existing.lines().any(|line| Path::new(line) == path) {
        return Ok(());
    }

    let mut out = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&file)
        .with_context(|| format!("failed to open {}", file.display()))?;
    writeln!(out, "{}", path.display())
        .with_context(|| format!("failed to append to {}", file.display()))?;
    Ok(())
}

/// Appends a host path to the trusted folder list, once.
pub fn add_trusted_path(path: &Path) -> Result<()> {
    add_trusted_path_in(&config_dir()?, path)
}

fn trusted_paths_in(config_dir: &Path) -> Vec<PathBuf> {
    let file = config_dir.join("trusted.txt");
    fs::read_to_string(file)
        .unwrap_or_default()
        .lines()
        .filter(|line| !line.is_empty())
        .map(PathBuf::from)
        .collect()
}

/// The host paths the user has elected to expose inside the guest view.
pub fn trusted_paths() -> Result<Vec<PathBuf>> {
    Ok(trusted_paths_in(&config_dir()?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn sample_config() -> Config {
        let mut config = Config::default();
        config.rootfs_path = PathBuf::from("/tmp/rootfs");
        config.quiet = true;
        config.block_limit = 0x1234;
        config.enabled_thunks = "libGL.so.1".to_string();
        config.rebuild_environment();
        config
    }

    #[test]
    fn truthy_values() {
        for text in ["true", "TRUE", "1", "yes", "on", "y", "enable", "Enable"] {
            assert!(is_truthy(text), "{text}");
        }
        for text in ["false", "0", "no", "off", "2", "", "enabled"] {
            assert!(!is_truthy(text), "{text}");
        }
    }

    #[test]
    fn integers_parse_in_both_bases() {
        assert_eq!(parse_integer("1234").unwrap(), 1234);
        assert_eq!(parse_integer("0x1234").unwrap(), 0x1234);
        assert_eq!(parse_integer("0").unwrap(), 0);
        assert!(parse_integer("banana").is_err());
        assert!(parse_integer("0xzz").is_err());
    }

    #[test]
    fn hex_round_trips() {
        assert_eq!(hex_encode(&[0xde, 0xad]), "DEAD");
        assert_eq!(hex_decode("DEAD").unwrap(), vec![0xde, 0xad]);
        assert_eq!(hex_decode("dead").unwrap(), vec![0xde, 0xad]);

        let data = "FELIX86_QUIET=1\nFELIX86_ROOTFS=/tmp/rootfs";
        assert_eq!(
            hex_decode(&hex_encode(data.as_bytes())).unwrap(),
            data.as_bytes()
        );

        assert!(hex_decode("ABC").is_err());
        assert!(hex_decode("GG").is_err());
    }

    #[test]
    fn environment_buffer_lists_non_default_fields() {
        let config = sample_config();
        let env = &config.environment;
        assert!(env.contains("\nFELIX86_QUIET=true"));
        assert!(env.contains("\nFELIX86_BLOCK_LIMIT=0x1234"));
        assert!(env.contains("\nFELIX86_ROOTFS=/tmp/rootfs"));
        assert!(!env.contains("FELIX86_VERBOSE"));
        assert!(!env.contains("FELIX86_BLOCK_LINKING"));
    }

    #[test]
    fn save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");

        let config = sample_config();
        save(&path, &config).unwrap();

        let text = fs::read_to_string(&path).unwrap();
        assert!(text.contains("[paths]"));
        assert!(text.contains("# quiet (bool)"));
        assert!(text.contains("# Environment variable: FELIX86_QUIET"));

        let loaded = load(&path, true).unwrap();
        assert_eq!(loaded.rootfs_path, config.rootfs_path);
        assert_eq!(loaded.quiet, config.quiet);
        assert_eq!(loaded.block_limit, config.block_limit);
        assert_eq!(loaded.enabled_thunks, config.enabled_thunks);
        assert_eq!(loaded.block_linking, true);
        assert_eq!(loaded.environment, config.environment);
    }

    #[test]
    fn missing_required_field_fails_with_a_useful_message() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        save(&path, &Config::default()).unwrap();
        // The written default has an empty rootfs_path, which still counts
        // as supplied; drop the key entirely to simulate a blank file.
        fs::write(&path, "[general]\nquiet = true\n").unwrap();

        let err = load(&path, true).unwrap_err().to_string();
        assert!(err.contains("rootfs_path"), "{err}");
        assert!(err.contains("FELIX86_ROOTFS"), "{err}");
        assert!(err.contains("config.toml"), "{err}");
    }

    #[test]
    #[serial]
    fn environment_overrides_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let mut config = Config::default();
        config.rootfs_path = PathBuf::from("/tmp/rootfs");
        save(&path, &config).unwrap();

        env::set_var("FELIX86_QUIET", "yes");
        env::set_var("FELIX86_BLOCK_LIMIT", "0x40");
        let loaded = load(&path, false);
        env::remove_var("FELIX86_QUIET");
        env::remove_var("FELIX86_BLOCK_LIMIT");

        let loaded = loaded.unwrap();
        assert!(loaded.quiet);
        assert_eq!(loaded.block_limit, 0x40);
    }

    #[test]
    fn profile_save_emits_only_changes() {
        let dir = tempfile::tempdir().unwrap();
        write_default_profiles(dir.path()).unwrap();

        for name in ["safe", "extreme", "paranoid", "zink"] {
            assert!(dir.path().join("profiles").join(format!("{name}.toml")).exists());
        }

        let safe = fs::read_to_string(dir.path().join("profiles/safe.toml")).unwrap();
        assert!(safe.contains("strict_memory_ordering = true"));
        assert!(safe.contains("block_linking = false"));
        assert!(!safe.contains("rootfs_path"));
        assert!(!safe.contains("quiet"));
    }

    #[test]
    fn profiles_overlay_only_present_fields() {
        let dir = tempfile::tempdir().unwrap();
        write_default_profiles(dir.path()).unwrap();

        let mut config = sample_config();
        apply_profile(&mut config, "SAFE", dir.path()).unwrap();

        assert!(config.strict_memory_ordering);
        assert!(!config.block_linking);
        // Untouched by the profile.
        assert!(config.quiet);
        assert_eq!(config.rootfs_path, PathBuf::from("/tmp/rootfs"));

        // Absolute selectors bypass the profiles directory.
        let custom = dir.path().join("custom.toml");
        fs::write(&custom, "[general]\nverbose = true\n").unwrap();
        apply_profile(&mut config, custom.to_str().unwrap(), dir.path()).unwrap();
        assert!(config.verbose);
    }

    #[test]
    fn snapshot_round_trips_into_a_child_config() {
        let config = sample_config();
        let hex = hex_for(&config);

        let child = child_config_from_hex(&hex).unwrap();
        assert!(child.quiet);
        assert_eq!(child.rootfs_path, PathBuf::from("/tmp/rootfs"));
        assert_eq!(child.block_limit, 0x1234);

        // Every field the parent left at its default arrives as the default.
        let defaults = Config::default();
        for field in SCHEMA {
            if matches!(
                field.name,
                "rootfs_path" | "quiet" | "block_limit" | "enabled_thunks"
            ) {
                continue;
            }
            assert_eq!(
                child.get(field.name),
                defaults.get(field.name),
                "{}",
                field.name
            );
        }
    }

    #[test]
    fn snapshot_errors_are_fatal() {
        assert!(child_config_from_hex("").is_err());
        assert!(child_config_from_hex("ABC").is_err());
        // Valid hex, but missing fields.
        assert!(child_config_from_hex(&hex_encode(b"FELIX86_QUIET=1")).is_err());
    }

    #[test]
    fn trusted_paths_are_deduplicated() {
        let dir = tempfile::tempdir().unwrap();
        add_trusted_path_in(dir.path(), Path::new("/opt/games")).unwrap();
        add_trusted_path_in(dir.path(), Path::new("/opt/tools")).unwrap();
        add_trusted_path_in(dir.path(), Path::new("/opt/games")).unwrap();

        assert_eq!(
            trusted_paths_in(dir.path()),
            vec![PathBuf::from("/opt/games"), PathBuf::from("/opt/tools")]
        );
    }

    #[test]
    #[serial]
    fn initialize_creates_config_and_profiles() {
        let home = tempfile::tempdir().unwrap();
        let old_home = env::var_os("HOME");
        let old_sudo_home = env::var_os("SUDO_HOME");
        env::set_var("HOME", home.path());
        env::remove_var("SUDO_HOME");
        env::set_var("FELIX86_ROOTFS", "/tmp/rootfs");

        let result = initialize(false);

        env::remove_var("FELIX86_ROOTFS");
        match old_home {
            Some(v) => env::set_var("HOME", v),
            None => env::remove_var("HOME"),
        }
        if let Some(v) = old_sudo_home {
            env::set_var("SUDO_HOME", v);
        }

        result.unwrap();
        let dir = home.path().join(".config/felix86");
        assert!(dir.join("config.toml").exists());
        assert!(dir.join("profiles/zink.toml").exists());
        assert_eq!(current().rootfs_path, PathBuf::from("/tmp/rootfs"));
    }
}
