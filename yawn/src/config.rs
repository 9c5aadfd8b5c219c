//! Line-oriented `key=value` configuration.
//!
//! Grammar: one `key=value` pair per line, `#` starts a comment (whole-line
//! or trailing), surrounding whitespace is trimmed from both key and value.
//! Malformed lines — no `=`, a comment marker before the `=`, an empty key
//! or value — are silently dropped. Getters are typed and fall back to the
//! caller's default when the key is absent or fails to parse.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::Path;

#[derive(Default, Clone)]
pub struct Config {
    entries: HashMap<String, String>,
}

impl Config {
    /// Load from `path`; unreadable files fall back to the default table.
    pub fn load<P: AsRef<Path>>(path: P) -> Config {
        let path = path.as_ref();
        match fs::read_to_string(path) {
            Ok(text) => {
                let cfg = Config::parse_str(&text);
                if cfg.entries.is_empty() {
                    log::warn!("No usable entries in \"{}\"", path.display());
                }
                cfg
            }
            Err(e) => {
                log::warn!(
                    "Failed to load config from \"{}\" ({e}); using defaults",
                    path.display()
                );
                Config::defaults()
            }
        }
    }

    /// Parse configuration text, dropping malformed lines.
    pub fn parse_str(text: &str) -> Config {
        let mut cfg = Config::default();
        for line in text.lines() {
            cfg.parse_line(line);
        }
        cfg
    }

    /// The built-in default table, used when no config file is readable.
    pub fn defaults() -> Config {
        let mut cfg = Config::default();
        for (key, val) in [
            // server
            ("listen_ip", "0.0.0.0"),
            ("listen_port", "6789"),
            ("timeout", "60000"),
            ("open_linger", "true"),
            ("trig_mode", "3"),
            ("thread_pool_num", "8"),
            ("src_dir", "/var/www/html"),
            // log
            ("open_log", "true"),
            ("log_type", "3"),
            ("log_level", "info"),
            ("log_max_file_size", "20971520"),
            ("log_queue_size", "1024"),
            ("log_dir", "/tmp/yawn_logs"),
            ("log_filename", "yawn"),
            // db (recognized; the auth helper is optional and unused by
            // static serving)
            ("enable_db", "false"),
            ("sql_host", "localhost"),
            ("sql_port", "3306"),
            ("sql_username", "username"),
            ("sql_passwd", "password"),
            ("conn_pool_num", "10"),
            ("db_name", "yawn"),
        ] {
            cfg.entries.insert(key.to_string(), val.to_string());
        }
        cfg
    }

    fn parse_line(&mut self, line: &str) -> bool {
        let eq = match line.find('=') {
            Some(pos) => pos,
            None => return false,
        };
        let comment = line.find('#');
        if comment.is_some_and(|pos| pos < eq) {
            return false;
        }
        let end = comment.unwrap_or(line.len());

        let key = line[..eq].trim();
        if key.is_empty() {
            return false;
        }
        let val = line[eq + 1..end].trim();
        if val.is_empty() {
            return false;
        }
        self.entries.insert(key.to_string(), val.to_string());
        true
    }

    /// Insert or overwrite an entry.
    pub fn set(&mut self, key: &str, val: &str) {
        self.entries.insert(key.to_string(), val.to_string());
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    pub fn get_string(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or(default).to_string()
    }

    pub fn get_integer(&self, key: &str, default: i64) -> i64 {
        match self.get(key) {
            Some(raw) => match raw.parse() {
                Ok(v) => v,
                Err(_) => {
                    log::warn!("Config key {key}: \"{raw}\" is not an integer");
                    default
                }
            },
            None => default,
        }
    }

    pub fn get_float(&self, key: &str, default: f64) -> f64 {
        match self.get(key) {
            Some(raw) => match raw.parse() {
                Ok(v) => v,
                Err(_) => {
                    log::warn!("Config key {key}: \"{raw}\" is not a number");
                    default
                }
            },
            None => default,
        }
    }

    pub fn get_bool(&self, key: &str, default: bool) -> bool {
        match self.get(key) {
            Some("true") => true,
            Some("false") => false,
            _ => default,
        }
    }
}

impl fmt::Display for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<_> = self.entries.keys().collect();
        keys.sort();
        for key in keys {
            writeln!(f, "{}: {}", key, self.entries[key])?;
        }
        Ok(())
    }
}
