use libc::mode_t;

/// Which `open` requests get their mode replaced, and with what.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModeRule {
    pub prefix: &'static [u8],
    pub min_len: usize,
    pub extension: &'static [u8],
    pub mode: mode_t,
}

impl ModeRule {
    /// New `.mkv` files directly or indirectly under `/output/` get the mode
    /// `touch` would request, so the umask alone decides the final bits.
    ///
    /// `/output/title00.mkv` is the shortest name makemkvcon produces.
    pub const OUTPUT_MKV: ModeRule = ModeRule {
        prefix: b"/output/",
        min_len: 19,
        extension: b".mkv",
        mode: libc::S_IRUSR
            | libc::S_IWUSR
            | libc::S_IRGRP
            | libc::S_IWGRP
            | libc::S_IROTH
            | libc::S_IWOTH,
    };

    pub fn matches(&self, path: &[u8]) -> bool {
        if path.len() < self.min_len || !path.starts_with(self.prefix) {
            return false;
        }
        match path.iter().rposition(|&b| b == b'.') {
            Some(dot) => &path[dot..] == self.extension,
            None => false,
        }
    }

    /// The mode to hand to the real `open`.
    pub fn apply(&self, path: &[u8], requested: mode_t) -> mode_t {
        if self.matches(path) { self.mode } else { requested }
    }
}

impl Default for ModeRule {
    fn default() -> Self {
        Self::OUTPUT_MKV
    }
}
