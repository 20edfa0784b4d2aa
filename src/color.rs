#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
pub enum ColorMode {
    Never,
    #[default]
    Auto,
    Always,
}

impl ColorMode {
    /// Whether output to stdout should be colored under this mode.
    pub fn enabled(self) -> bool {
        self == ColorMode::Always || (self == ColorMode::Auto && atty::is(atty::Stream::Stdout))
    }
}
