//! Configuraiton parameters struct parsing helper.

/// Composes a configuration struct from its default values, then overwrites
/// given fields by parsing from given TOML string if it's not `None`. Returns
/// an `Ok(config)` on success, and `Err(QuorumKvError)` on parser failure.
///
/// Example:
/// ```ignore
/// let config = parsed_config!(config_str => MyConfig; wal_dir, timeout_ms)?;
/// ```
#[macro_export]
macro_rules! parsed_config {
    ($config_str:expr => $config_type:ty; $($field:ident),+) => {{
        let config_str: Option<&str> = $config_str;

        // closure helper for easier error returning
        let compose_config = || -> Result<$config_type, $crate::QuorumKvError> {
            let mut config: $config_type = Default::default();
            let mut table = match config_str {
                Some(s) => s.parse::<toml::Table>()?,
                None => return Ok(config),
            };

            // traverse through all given field names
            $({
                // if field name found in table (and removed)
                if let Some(v) = table.remove(stringify!($field)) {
                    config.$field = v.try_into()?;
                }
            })+

            // if table is not empty at this time, some parsed keys are not
            // expected hence invalid
            if let Some(key) = table.keys().next() {
                return Err($crate::QuorumKvError::msg(format!(
                    "invalid field name '{}' in config",
                    key,
                )));
            }

            Ok(config)
        };

        compose_config()
    }};
}

#[cfg(test)]
mod config_tests {
    use crate::utils::QuorumKvError;

    use serde::Deserialize;

    #[derive(Debug, PartialEq, Clone, Copy, Deserialize)]
    #[serde(rename_all = "lowercase")]
    enum TestMode {
        Fast,
        Slow,
    }

    #[derive(Debug, PartialEq)]
    struct TestConfig {
        abc: u16,
        hij: String,
        mode: TestMode,
    }

    impl Default for TestConfig {
        fn default() -> Self {
            TestConfig {
                abc: 7,
                hij: "Jose".into(),
                mode: TestMode::Slow,
            }
        }
    }

    #[test]
    fn parse_from_none() -> Result<(), QuorumKvError> {
        let config = parsed_config!(None => TestConfig; abc, hij, mode)?;
        let ref_config: TestConfig = Default::default();
        assert_eq!(config, ref_config);
        Ok(())
    }

    #[test]
    fn parse_from_partial() -> Result<(), QuorumKvError> {
        let config_str = Some("hij = 'Nice'\nmode = 'fast'");
        let config = parsed_config!(config_str => TestConfig; hij, mode)?;
        let ref_config = TestConfig {
            abc: 7,
            hij: "Nice".into(),
            mode: TestMode::Fast,
        };
        assert_eq!(config, ref_config);
        Ok(())
    }

    #[test]
    fn parse_invalid_field() {
        let config_str = Some("xyz = 999");
        assert!(parsed_config!(config_str => TestConfig; abc).is_err());
    }

    #[test]
    fn parse_invalid_enum_value() {
        let config_str = Some("mode = 'medium'");
        assert!(parsed_config!(config_str => TestConfig; mode).is_err());
    }
}
