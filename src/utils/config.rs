//! Configuration parameters struct parsing helper.

/// Composes a configuration struct from its default values, then overwrites
/// given fields by parsing from given TOML string if it's not `None`. Returns
/// an `Ok(config)` on success, and `Err(ShardKvError)` on parser failure or
/// if the TOML string names a field not in the given list.
///
/// Example:
/// ```no_compile
/// let config = parsed_config!(config_str => ClusterConfig; nservers, nreplicas)?;
/// ```
#[macro_export]
macro_rules! parsed_config {
    ($config_str:expr => $config_type:ty; $($field:ident),+) => {{
        let config_str: Option<&str> = $config_str;

        // closure helper for easier error returning
        let compose_config = || -> Result<$config_type, $crate::ShardKvError> {
            let mut config: $config_type = Default::default();
            let Some(config_str) = config_str else {
                return Ok(config);
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
                return Err($crate::ShardKvError::msg(format!(
                    "invalid field name '{}' in config",
                    key
                )));
            }

            Ok(config)
        };

        compose_config()
    }};
}

#[cfg(test)]
mod config_tests {
    use crate::utils::ShardKvError;

    #[derive(Debug, PartialEq)]
    struct TestConfig {
        population: u8,
        label: String,
        backoff_ms: u64,
    }

    impl Default for TestConfig {
        fn default() -> Self {
            TestConfig {
                population: 5,
                label: "shard".into(),
                backoff_ms: 20,
            }
        }
    }

    #[test]
    fn parse_from_none() -> Result<(), ShardKvError> {
        let config =
            parsed_config!(None => TestConfig; population, label, backoff_ms)?;
        let ref_config: TestConfig = Default::default();
        assert_eq!(config, ref_config);
        Ok(())
    }

    #[test]
    fn parse_from_partial() -> Result<(), ShardKvError> {
        let config_str = Some("label = 'group'\nbackoff_ms = 75");
        let config =
            parsed_config!(config_str => TestConfig; label, backoff_ms)?;
        let ref_config = TestConfig {
            population: 5,
            label: "group".into(),
            backoff_ms: 75,
        };
        assert_eq!(config, ref_config);
        Ok(())
    }

    #[test]
    fn parse_invalid_field() {
        let config_str = Some("replicas = 9");
        assert!(parsed_config!(config_str => TestConfig; population).is_err());
    }

    #[test]
    fn parse_wrong_type() {
        let config_str = Some("population = 'many'");
        assert!(parsed_config!(config_str => TestConfig; population).is_err());
    }
}
