//! File-system boundary the handle tracker delegates to.

#![allow(unsafe_code)]

use std::collections::{BTreeMap, HashMap};
use std::ffi::CString;
use std::io;

use crate::error::MembraneError;

/// Parsed fopen-style open mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct OpenMode {
    pub readable: bool,
    pub writable: bool,
    pub append: bool,
    pub truncate: bool,
    pub create: bool,
    pub exclusive: bool,
}

impl OpenMode {
    /// Parse `r`, `w`, `a` followed by any of `+`, `b`, `x`.
    pub fn parse(mode: &str) -> Result<Self, MembraneError> {
        let invalid = || MembraneError::OpenMode(mode.to_string());
        let mut chars = mode.chars();
        let mut flags = match chars.next().ok_or_else(invalid)? {
            'r' => Self {
                readable: true,
                ..Self::default()
            },
            'w' => Self {
                writable: true,
                create: true,
                truncate: true,
                ..Self::default()
            },
            'a' => Self {
                writable: true,
                create: true,
                append: true,
                ..Self::default()
            },
            _ => return Err(invalid()),
        };
        for modifier in chars {
            match modifier {
                '+' => {
                    flags.readable = true;
                    flags.writable = true;
                }
                'b' => {}
                'x' => flags.exclusive = true,
                _ => return Err(invalid()),
            }
        }
        Ok(flags)
    }

    /// `O_*` bits for `open(2)`.
    #[must_use]
    pub fn oflags(self) -> libc::c_int {
        let mut oflags = match (self.readable, self.writable) {
            (true, true) => libc::O_RDWR,
            (false, true) => libc::O_WRONLY,
            _ => libc::O_RDONLY,
        };
        if self.create {
            oflags |= libc::O_CREAT;
        }
        if self.truncate {
            oflags |= libc::O_TRUNC;
        }
        if self.append {
            oflags |= libc::O_APPEND;
        }
        if self.exclusive {
            oflags |= libc::O_EXCL;
        }
        oflags | libc::O_CLOEXEC
    }
}

/// Handle-based file operations.
pub trait FileSystem {
    fn open(&mut self, path: &str, mode: OpenMode) -> io::Result<i32>;
    fn close(&mut self, handle: i32) -> io::Result<()>;
    fn duplicate(&mut self, handle: i32) -> io::Result<i32>;
    fn read(&mut self, handle: i32, buf: &mut [u8]) -> io::Result<usize>;
}

/// The host's descriptors through `libc`.
#[derive(Debug, Default, Clone, Copy)]
pub struct PosixFileSystem;

fn check(ret: libc::c_int) -> io::Result<libc::c_int> {
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}

impl FileSystem for PosixFileSystem {
    fn open(&mut self, path: &str, mode: OpenMode) -> io::Result<i32> {
        let c_path = CString::new(path).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        // SAFETY: c_path is a valid NUL-terminated string for the call.
        check(unsafe { libc::open(c_path.as_ptr(), mode.oflags(), 0o666 as libc::c_uint) })
    }

    fn close(&mut self, handle: i32) -> io::Result<()> {
        // SAFETY: closing an arbitrary descriptor is memory safe.
        check(unsafe { libc::close(handle) }).map(drop)
    }

    fn duplicate(&mut self, handle: i32) -> io::Result<i32> {
        // SAFETY: dup has no memory preconditions.
        check(unsafe { libc::dup(handle) })
    }

    fn read(&mut self, handle: i32, buf: &mut [u8]) -> io::Result<usize> {
        // SAFETY: buf is valid for buf.len() writable bytes.
        let n = unsafe { libc::read(handle, buf.as_mut_ptr().cast(), buf.len()) };
        if n < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(n as usize)
        }
    }
}

#[derive(Debug, Clone)]
struct OpenFile {
    path: String,
    position: usize,
}

/// In-memory file system with POSIX lowest-free handle numbering.
#[derive(Debug, Default)]
pub struct MemoryFileSystem {
    files: HashMap<String, Vec<u8>>,
    open: BTreeMap<i32, OpenFile>,
    forced: Option<i32>,
}

/// Handles below this are left to the standard streams.
const FIRST_HANDLE: i32 = 3;

impl MemoryFileSystem {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create or replace a file.
    pub fn insert(&mut self, path: &str, contents: impl Into<Vec<u8>>) {
        self.files.insert(path.to_string(), contents.into());
    }

    /// Hand out `handle` on the next successful open or duplicate, even if
    /// it is in use, to simulate a handle recycled behind the tracker's back.
    pub fn force_next_handle(&mut self, handle: i32) {
        self.forced = Some(handle);
    }

    /// Currently open handles.
    pub fn open_handles(&self) -> impl Iterator<Item = i32> + '_ {
        self.open.keys().copied()
    }

    fn next_handle(&mut self) -> i32 {
        if let Some(forced) = self.forced.take() {
            return forced;
        }
        let mut candidate = FIRST_HANDLE;
        for &used in self.open.keys() {
            if used == candidate {
                candidate += 1;
            } else if used > candidate {
                break;
            }
        }
        candidate
    }

    fn bad_handle() -> io::Error {
        io::Error::from_raw_os_error(libc::EBADF)
    }
}

impl FileSystem for MemoryFileSystem {
    fn open(&mut self, path: &str, mode: OpenMode) -> io::Result<i32> {
        let exists = self.files.contains_key(path);
        if !exists && !mode.create {
            return Err(io::Error::from_raw_os_error(libc::ENOENT));
        }
        if exists && mode.exclusive {
            return Err(io::Error::from_raw_os_error(libc::EEXIST));
        }
        let contents = self.files.entry(path.to_string()).or_default();
        if mode.truncate {
            contents.clear();
        }
        let handle = self.next_handle();
        self.open.insert(
            handle,
            OpenFile {
                path: path.to_string(),
                position: 0,
            },
        );
        Ok(handle)
    }

    fn close(&mut self, handle: i32) -> io::Result<()> {
        self.open.remove(&handle).map(drop).ok_or_else(Self::bad_handle)
    }

    fn duplicate(&mut self, handle: i32) -> io::Result<i32> {
        let file = self.open.get(&handle).cloned().ok_or_else(Self::bad_handle)?;
        let fresh = self.next_handle();
        self.open.insert(fresh, file);
        Ok(fresh)
    }

    fn read(&mut self, handle: i32, buf: &mut [u8]) -> io::Result<usize> {
        let file = self.open.get_mut(&handle).ok_or_else(Self::bad_handle)?;
        let contents = self.files.get(&file.path).map_or(&[][..], Vec::as_slice);
        let remaining = contents.get(file.position..).unwrap_or_default();
        let n = remaining.len().min(buf.len());
        buf[..n].copy_from_slice(&remaining[..n]);
        file.position += n;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_modes() {
        let r = OpenMode::parse("r").unwrap();
        assert!(r.readable && !r.writable);
        let w = OpenMode::parse("w+").unwrap();
        assert!(w.readable && w.writable && w.truncate && w.create);
        let a = OpenMode::parse("ab").unwrap();
        assert!(a.append && a.writable && !a.readable);
        assert!(OpenMode::parse("wx").unwrap().exclusive);
        assert!(OpenMode::parse("").is_err());
        assert!(OpenMode::parse("q").is_err());
        assert!(OpenMode::parse("rz").is_err());
    }

    #[test]
    fn oflags_map_access_mode() {
        assert_eq!(OpenMode::parse("r").unwrap().oflags() & libc::O_ACCMODE, libc::O_RDONLY);
        assert_eq!(OpenMode::parse("w").unwrap().oflags() & libc::O_ACCMODE, libc::O_WRONLY);
        assert_eq!(OpenMode::parse("r+").unwrap().oflags() & libc::O_ACCMODE, libc::O_RDWR);
        assert_ne!(OpenMode::parse("a").unwrap().oflags() & libc::O_APPEND, 0);
    }

    #[test]
    fn memory_handles_are_lowest_free() {
        let mut fs = MemoryFileSystem::new();
        fs.insert("a", "x");
        let mode = OpenMode::parse("r").unwrap();
        let a = fs.open("a", mode).unwrap();
        let b = fs.open("a", mode).unwrap();
        assert_eq!((a, b), (3, 4));
        fs.close(a).unwrap();
        assert_eq!(fs.open("a", mode).unwrap(), 3);
        assert_eq!(fs.duplicate(b).unwrap(), 5);
    }

    #[test]
    fn memory_read_advances() {
        let mut fs = MemoryFileSystem::new();
        fs.insert("data", "hello");
        let h = fs.open("data", OpenMode::parse("r").unwrap()).unwrap();
        let mut buf = [0u8; 3];
        assert_eq!(fs.read(h, &mut buf).unwrap(), 3);
        assert_eq!(&buf, b"hel");
        assert_eq!(fs.read(h, &mut buf).unwrap(), 2);
        assert_eq!(fs.read(h, &mut buf).unwrap(), 0);
    }

    #[test]
    fn memory_errors_match_posix() {
        let mut fs = MemoryFileSystem::new();
        let err = fs.open("missing", OpenMode::parse("r").unwrap()).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::ENOENT));
        assert_eq!(fs.close(9).unwrap_err().raw_os_error(), Some(libc::EBADF));
    }

    #[test]
    fn posix_round_trip_through_a_temp_file() {
        let path = std::env::temp_dir().join(format!("tripwire-fs-{}", std::process::id()));
        std::fs::write(&path, b"posix").unwrap();
        let mut fs = PosixFileSystem;
        let h = fs
            .open(path.to_str().unwrap(), OpenMode::parse("r").unwrap())
            .unwrap();
        let dup = fs.duplicate(h).unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(fs.read(dup, &mut buf).unwrap(), 5);
        fs.close(dup).unwrap();
        fs.close(h).unwrap();
        let _ = std::fs::remove_file(&path);
    }
}
