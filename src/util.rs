use std::path::{Path, PathBuf};

/// Fetch `[$sec] $key` from a toml table, falling back to `$or` (with a warning) when the key is
/// missing or has the wrong type.
macro_rules! tomlget_or {
    ($cfg:ident, $sec:expr, $key:expr, as_str, $or:expr) => {
        $cfg.get($sec)
            .and_then(|sec| sec.get($key))
            .and_then(|val| val.as_str())
            .unwrap_or_else(|| {
                ::log::warn!(
                    "failed to get {}:{} as string in config; proceeding with default {:?}",
                    $sec,
                    $key,
                    $or
                );
                $or
            })
    };
    ($cfg:ident, $sec:expr, $key:expr, as_bool, $or:expr) => {
        $cfg.get($sec)
            .and_then(|sec| sec.get($key))
            .and_then(|val| val.as_bool())
            .unwrap_or_else(|| {
                ::log::warn!(
                    "failed to get {}:{} as bool in config; proceeding with default {:?}",
                    $sec,
                    $key,
                    $or
                );
                $or
            })
    };
    ($cfg:ident, $sec:expr, $key:expr, $conv:ident, $as:ty, $or:expr) => {
        $cfg.get($sec)
            .and_then(|sec| sec.get($key))
            .map(|val| val.$conv())
            .unwrap_or_else(|| {
                ::log::warn!(
                    "failed to find {}:{} in config; proceeding with default {:?}",
                    $sec,
                    $key,
                    $or
                );
                Some($or)
            })
            .unwrap_or_else(|| {
                ::log::warn!(
                    "failed to convert {}:{} to {}; proceeding with default {:?}",
                    $sec,
                    $key,
                    stringify!($as),
                    $or
                );
                $or
            }) as $as
    };
}

macro_rules! tomlget_opt {
    ($cfg:ident, $sec:expr, $key:expr, as_str) => {
        $cfg.get($sec)
            .and_then(|sec| sec.get($key))
            .and_then(|val| val.as_str())
    };
    ($cfg:ident, $sec:expr, $key:expr, $conv:ident, $as:ty) => {
        $cfg.get($sec)
            .and_then(|sec| sec.get($key))
            .and_then(|val| val.$conv())
            .map(|val| val as $as)
    };
}

macro_rules! tomlget {
    ($cfg:ident, $sec:expr, $key:expr, as_str) => {
        $cfg.get($sec)
            .ok_or_else(|| format!("failed to get section {}", $sec))?
            .get($key)
            .ok_or_else(|| format!("failed to get key {}:{}", $sec, $key))?
            .as_str()
            .ok_or_else(|| format!("failed to convert {}:{} to string", $sec, $key))?
    };
    ($cfg:ident, $sec:expr, $key:expr, $conv:ident, $as:ty) => {
        $cfg.get($sec)
            .ok_or_else(|| format!("failed to get section {}", $sec))?
            .get($key)
            .ok_or_else(|| format!("failed to get key {}:{}", $sec, $key))?
            .$conv()
            .ok_or_else(|| format!("failed to convert {}:{} to {}", $sec, $key, stringify!($as)))?
            as $as
    };
}

/// Resolve a config or data file: absolute paths as given, relative paths against the working
/// directory first and then the directory holding the executable.
#[must_use]
pub fn find_file(file_name: &Path) -> Option<PathBuf> {
    if file_name.is_absolute() {
        return file_name.exists().then(|| file_name.into());
    }
    if let Ok(cwd) = std::env::current_dir() {
        if cwd.join(file_name).exists() {
            return Some(cwd.join(file_name));
        }
    }
    let exe = std::env::current_exe().ok()?;
    let beside_exe = exe.parent()?.join(file_name);
    beside_exe.exists().then_some(beside_exe)
}

/// `steps` evenly spaced values from `start` to `end`, both ends included (a single step yields
/// `start`).
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn linspace(start: f64, end: f64, steps: usize) -> Vec<f64> {
    match steps {
        0 => Vec::new(),
        1 => vec![start],
        n => {
            let step = (end - start) / (n - 1) as f64;
            (0..n).map(|i| start + step * i as f64).collect()
        }
    }
}

/// Round to `decimals` places, the precision the analyzer supply accepts.
#[must_use]
pub fn round_to(value: f64, decimals: i32) -> f64 {
    let scale = 10f64.powi(decimals);
    (value * scale).round() / scale
}

pub(crate) use {tomlget, tomlget_opt, tomlget_or};
