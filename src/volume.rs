//! Volume file naming and missing-volume resolution.

use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};

/// Path of volume `volume` of the archive whose first volume is `base`.
///
/// Volume 0 is `base` itself; later volumes swap the extension for `fNN`
/// (`backup.fsa`, `backup.f01`, `backup.f02`, ...).
pub fn volume_path(base: &Path, volume: u32) -> PathBuf {
    if volume == 0 {
        return base.to_path_buf();
    }
    base.with_extension(format!("f{volume:02}"))
}

/// Supplies a replacement path when an expected continuation volume is
/// missing.  `None` means no path will ever come.
pub trait VolumeResolver: Send {
    fn resolve(&mut self, expected: &Path, volume: u32) -> Option<PathBuf>;
}

impl<F> VolumeResolver for F
where
    F: FnMut(&Path, u32) -> Option<PathBuf> + Send,
{
    fn resolve(&mut self, expected: &Path, volume: u32) -> Option<PathBuf> {
        self(expected, volume)
    }
}

/// Asks on the terminal.  An empty answer retries the expected path (the
/// user may just have inserted the medium); end of input gives up.
#[derive(Debug, Default)]
pub struct StdinResolver;

impl VolumeResolver for StdinResolver {
    fn resolve(&mut self, expected: &Path, volume: u32) -> Option<PathBuf> {
        let mut out = io::stdout().lock();
        let _ = writeln!(
            out,
            "File [{}] is not found, please type the path to volume {}:",
            expected.display(),
            volume
        );
        let _ = write!(out, "New path:> ");
        let _ = out.flush();
        drop(out);

        let mut line = String::new();
        match io::stdin().lock().read_line(&mut line) {
            Ok(0) | Err(_) => None,
            Ok(_) => {
                let answer = line.trim();
                if answer.is_empty() {
                    Some(expected.to_path_buf())
                } else {
                    Some(PathBuf::from(answer))
                }
            }
        }
    }
}

/// Never supplies a path; a missing volume fails the read immediately.
#[derive(Debug, Default)]
pub struct NoPromptResolver;

impl VolumeResolver for NoPromptResolver {
    fn resolve(&mut self, _expected: &Path, _volume: u32) -> Option<PathBuf> {
        None
    }
}
