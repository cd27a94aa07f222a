use std::error::Error;
use std::fmt;

pub type BoxedError = Box<dyn Error + Send + Sync + 'static>;
pub type BoxedErrorResult<T> = std::result::Result<T, BoxedError>;

/// Renders an error and its source chain on a single line, for log fields.
pub struct CompactDisplay<'a>(&'a (dyn Error + 'static));

impl fmt::Display for CompactDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)?;
        let mut source = self.0.source();
        while let Some(err) = source {
            write!(f, ": {err}")?;
            source = err.source();
        }
        Ok(())
    }
}

pub trait FmtCompact {
    fn fmt_compact(&self) -> CompactDisplay<'_>;
}

impl<E> FmtCompact for E
where
    E: Error + 'static,
{
    fn fmt_compact(&self) -> CompactDisplay<'_> {
        CompactDisplay(self)
    }
}

impl FmtCompact for dyn Error + Send + Sync + 'static {
    fn fmt_compact(&self) -> CompactDisplay<'_> {
        CompactDisplay(self)
    }
}
