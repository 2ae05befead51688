/// Ordered environment captured from a runtime build. Values are kept
/// verbatim, including embedded newlines and spaces.
pub type EnvVars = Vec<(String, String)>;

/// Variables describing the build shell itself rather than the runtime.
const IGNORED_VARS: &[&str] = &[
    "PWD",
    "OLDPWD",
    "SHLVL",
    "_",
    "HOME",
    "TMPDIR",
    "TMP",
    "TEMP",
    "TEMPDIR",
    "NIX_BUILD_TOP",
];

/// Parses the output of `env -0`: `KEY=VALUE` records separated by NUL.
pub fn parse_nul_separated(raw: &[u8]) -> EnvVars {
    raw.split(|b| *b == 0)
        .filter(|record| !record.is_empty())
        .filter_map(|record| {
            let record = String::from_utf8_lossy(record);
            let (key, value) = record.split_once('=')?;
            if key.is_empty() || IGNORED_VARS.contains(&key) {
                return None;
            }
            Some((key.to_string(), value.to_string()))
        })
        .collect()
}

pub fn lookup<'a>(env: &'a EnvVars, key: &str) -> Option<&'a str> {
    env.iter()
        .rev()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.as_str())
}
