pub mod api;
pub mod config;
pub mod core;

const VERSION_MESSAGE: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    " (",
    env!("VERGEN_BUILD_TIMESTAMP"),
    ")\n",
    "Branch: ",
    env!("VERGEN_GIT_BRANCH"),
    "\nCommit: ",
    env!("VERGEN_GIT_SHA"),
);

/// Version banner shown by `gpu-schedulerd --version`, grounded on the
/// teacher's `gflow_core::version()`.
pub fn version() -> &'static str {
    let author = clap::crate_authors!();
    Box::leak(Box::new(format!("{VERSION_MESSAGE}\nAuthors: {author}")))
}
