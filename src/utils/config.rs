//! Configuration parameters struct parsing helper.

/// Composes a configuration struct from its default values, then overwrites
/// given fields by parsing from given TOML string if it's not `None`. Returns
/// an `Ok(config)` on success, and `Err(GridError)` on parser failure.
///
/// Example:
/// ```ignore
/// let config = parsed_config!(config_str => MemberConfig; partition_count)?;
/// ```
#[macro_export]
macro_rules! parsed_config {
    ($config_str:expr => $config_type:ty; $($field:ident),+) => {{
        let config_str: Option<&str> = $config_str;

        // closure helper for easier error returning
        let compose_config = || -> Result<$config_type, $crate::GridError> {
            let mut config: $config_type = Default::default();
            let config_str = match config_str {
                Some(s) => s,
                None => return Ok(config),
            };

            let mut table = config_str.parse::<toml::Table>()?;

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
                return Err($crate::GridError::msg(format!(
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
    use crate::utils::GridError;

    #[derive(Debug, PartialEq)]
    struct TestConfig {
        partitions: u32,
        label: String,
        ratio: f64,
    }

    impl Default for TestConfig {
        fn default() -> Self {
            TestConfig {
                partitions: 257,
                label: "grid".into(),
                ratio: 0.75,
            }
        }
    }

    #[test]
    fn parse_from_none() -> Result<(), GridError> {
        let config = parsed_config!(None => TestConfig; partitions, label)?;
        let ref_config: TestConfig = Default::default();
        assert_eq!(config, ref_config);
        Ok(())
    }

    #[test]
    fn parse_from_partial() -> Result<(), GridError> {
        let config_str = Some("partitions = 31\nlabel = 'cache'");
        let config =
            parsed_config!(config_str => TestConfig; partitions, label, ratio)?;
        let ref_config = TestConfig {
            partitions: 31,
            label: "cache".into(),
            ratio: 0.75,
        };
        assert_eq!(config, ref_config);
        Ok(())
    }

    #[test]
    fn parse_invalid_field() {
        let config_str = Some("backups = 1");
        assert!(parsed_config!(config_str => TestConfig; partitions).is_err());
    }

    #[test]
    fn parse_wrong_type() {
        let config_str = Some("partitions = 'many'");
        assert!(parsed_config!(config_str => TestConfig; partitions).is_err());
    }
}
