//! Small helpers for reading typed values out of environment variables.

use std::env;
use std::str::FromStr;

pub fn var_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.parse::<T>().ok())
        .unwrap_or(default)
}

pub fn var_or_string(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

pub fn bool_var_or(key: &str, default: bool) -> bool {
    env::var(key)
        .ok()
        .map(|s| matches!(s.to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(default)
}

pub fn opt_var(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn var_or_falls_back_to_default_when_unset() {
        env::remove_var("AUTOMATION_TEST_VAR");
        assert_eq!(var_or::<u32>("AUTOMATION_TEST_VAR", 7), 7);
    }

    #[test]
    #[serial]
    fn var_or_parses_set_value() {
        env::set_var("AUTOMATION_TEST_VAR", "42");
        assert_eq!(var_or::<u32>("AUTOMATION_TEST_VAR", 7), 42);
        env::remove_var("AUTOMATION_TEST_VAR");
    }

    #[test]
    #[serial]
    fn bool_var_accepts_common_truthy_spellings() {
        env::set_var("AUTOMATION_TEST_BOOL", "YES");
        assert!(bool_var_or("AUTOMATION_TEST_BOOL", false));
        env::remove_var("AUTOMATION_TEST_BOOL");
    }
}
