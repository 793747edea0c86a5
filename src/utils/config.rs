//! TOML overrides for the replica and tracker configuration structs.

/// Builds a config struct from its `Default`, then overrides the listed
/// fields from the TOML string if one is given (the binaries take it from
/// `--config`, with `+` standing for newline). Keys that are not listed are
/// rejected, so a typo such as `backof_cap_ms` fails loudly instead of being
/// ignored.
///
/// Example:
/// ```no_compile
/// let config = parsed_config!(config_str => ReplicaConfig;
///                             backoff_base_ms, backoff_cap_ms)?;
/// ```
#[macro_export]
macro_rules! parsed_config {
    ($config_str:expr => $config_type:ty; $($field:ident),+) => {{
        let config_str: Option<&str> = $config_str;

        // closure helper for easier error returning
        let compose_config = || -> Result<$config_type, $crate::CausalKvError> {
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
                return Err($crate::CausalKvError::msg(format!(
                    "invalid field name '{}' in config",
                    key,
                )));
            }

            Ok(config)
        };

        compose_config()
    }};
}
