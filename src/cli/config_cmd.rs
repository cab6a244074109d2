//! Config CLI subcommands: show, defaults, validate.
//!
//! These commands never touch a serial port.

use std::path::Path;

use crate::config::{self, ConfigError, HarnessConfig};

/// Print the effective configuration (file plus env overrides) as TOML.
///
/// Returns 0 on success, 2 if the file cannot be read or rendered.
pub fn run_show(path: Option<&Path>) -> i32 {
    match config::load_unvalidated(path).and_then(|cfg| cfg.to_toml()) {
        Ok(text) => {
            print!("{text}");
            0
        }
        Err(e) => {
            eprintln!("ERROR: {e}");
            2
        }
    }
}

/// Print the built-in defaults (no file, no env overrides) as TOML.
pub fn run_defaults() -> i32 {
    match HarnessConfig::default().to_toml() {
        Ok(text) => {
            print!("{text}");
            0
        }
        Err(e) => {
            eprintln!("ERROR: {e}");
            2
        }
    }
}

/// Validate the effective configuration.
///
/// Returns 0 if valid, 1 if any problem is found, 2 if the file is unreadable.
pub fn run_validate(path: Option<&Path>) -> i32 {
    let cfg = match config::load_unvalidated(path) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("ERROR: {e}");
            return 2;
        }
    };
    let problems = problems(&cfg);
    if problems.is_empty() {
        println!("Configuration is valid.");
        0
    } else {
        for problem in &problems {
            eprintln!("WARNING: {problem}");
        }
        1
    }
}

fn problems(cfg: &HarnessConfig) -> Vec<String> {
    match cfg.validate() {
        Ok(()) => Vec::new(),
        Err(ConfigError::Invalid(problems)) => problems,
        Err(other) => vec![other.to_string()],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::{clear_env_vars as clear_env, ENV_LOCK};
    use std::io::Write;

    fn write_config(text: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(text.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_validate_passes_with_defaults() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_env();
        assert_eq!(run_validate(None), 0, "default config should pass validation");
    }

    #[test]
    fn test_validate_flags_inverted_on_range() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_env();
        let file = write_config("[cycle]\non_min_secs = 9.0\non_max_secs = 3.0\n");
        assert_eq!(run_validate(Some(file.path())), 1);
    }

    #[test]
    fn test_validate_unreadable_file() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_env();
        assert_eq!(run_validate(Some(Path::new("/nonexistent/soak.toml"))), 2);
    }

    #[test]
    fn test_show_and_defaults_succeed() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_env();
        assert_eq!(run_defaults(), 0);
        let file = write_config("[cycle]\ncycles = 3\n");
        assert_eq!(run_show(Some(file.path())), 0);
    }

    #[test]
    fn test_env_override_reaches_validation() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_env();
        std::env::set_var("RELAY_SOAK_ENCODING", "klingon");
        let code = run_validate(None);
        clear_env();
        assert_eq!(code, 1);
    }
}
