/// Returns the version string shown by `--version`.
pub(crate) fn full() -> String {
    format!("v{}", env!("CARGO_PKG_VERSION"))
}
