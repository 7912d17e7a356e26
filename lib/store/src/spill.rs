use std::fs::File;
use std::io::{self, Seek, SeekFrom, Write};
use std::os::fd::AsRawFd;
use std::os::unix::fs::FileExt;
use std::path::Path;

use bytes::BytesMut;

/// An unlinked temporary file holding one spilled payload.
///
/// The file is unlinked as soon as it is created, so dropping the handle
/// frees the space.
#[derive(Debug)]
pub struct SpillFile {
    file: File,
    len: usize,
}

impl SpillFile {
    pub fn create_in(dir: &Path) -> io::Result<Self> {
        let file = tempfile::tempfile_in(dir)?;
        Ok(Self { file, len: 0 })
    }

    /// Appends `data` to the end of the current contents.
    pub fn write(&mut self, data: &[u8]) -> io::Result<()> {
        self.file.write_all(data)?;
        self.len += data.len();
        Ok(())
    }

    /// Truncates the file to empty.
    pub fn clear(&mut self) -> io::Result<()> {
        self.file.set_len(0)?;
        // the write cursor must follow the truncation or the next append
        // would leave a hole.
        self.file.seek(SeekFrom::Start(0))?;
        self.len = 0;
        Ok(())
    }

    /// Reads the whole contents and appends them to `buf`.
    pub fn read_into(&self, buf: &mut BytesMut) -> io::Result<()> {
        let start = buf.len();
        buf.resize(start + self.len, 0);
        self.file.read_exact_at(&mut buf[start..], 0)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Hints the kernel that the cached pages of this file are not needed.
    pub fn advise_dont_need(&self) {
        // advisory only; a failure changes nothing.
        unsafe {
            libc::posix_fadvise(self.file.as_raw_fd(), 0, 0, libc::POSIX_FADV_DONTNEED);
        }
    }
}
