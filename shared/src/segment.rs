//! Named shared memory segment backing the control channel.
//!
//! On Windows the segment is a pagefile-backed section, so it disappears once the last handle
//! in either process is closed. Elsewhere a file in the shared-memory directory stands in for
//! it, with a count of live mappings ahead of the record so the file goes away at the same
//! point. This keeps the protocol usable by tests and tooling on any host.

use crate::{ChannelError, ControlRecord, SEGMENT_SIZE};
use tracing::debug;

pub(crate) struct Segment {
    mapping: imp::Mapping,
    name: String,
}

impl Segment {
    /// Create (or open, if the name is already taken) a read-write segment.
    ///
    /// The returned flag is true when the name already existed.
    pub(crate) fn create(name: &str, size: usize) -> Result<(Self, bool), ChannelError> {
        debug!(name, size, "Creating control channel segment");
        let (mapping, existed) = imp::Mapping::create(name, size)?;
        Ok((
            Self {
                mapping,
                name: name.to_string(),
            },
            existed,
        ))
    }

    /// Open an existing segment for reading.
    pub(crate) fn open(name: &str) -> Result<Self, ChannelError> {
        debug!(name, "Opening control channel segment");
        let mapping = imp::Mapping::open(name, SEGMENT_SIZE)?;
        Ok(Self {
            mapping,
            name: name.to_string(),
        })
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    /// Do not destroy the backing object on drop; it belongs to another peer.
    pub(crate) fn leave_backing(&mut self) {
        self.mapping.leave_backing();
    }

    pub(crate) fn as_ptr(&self) -> *mut u8 {
        self.mapping.as_ptr()
    }

    pub(crate) fn record(&self) -> &ControlRecord {
        // SAFETY: the view is page-aligned, at least SEGMENT_SIZE bytes long and stays mapped
        // for the lifetime of `self`. Every mutable field of the record is an atomic.
        unsafe { &*(self.as_ptr() as *const ControlRecord) }
    }
}

#[cfg(windows)]
mod imp {
    use crate::ChannelError;
    use windows::core::{Error, PCWSTR};
    use windows::Win32::Foundation::*;
    use windows::Win32::System::Memory::*;

    pub(crate) struct Mapping {
        handle: HANDLE,
        view: MEMORY_MAPPED_VIEW_ADDRESS,
    }

    // SAFETY: the section handle and view are owned by this type and only released in Drop.
    // Section handles and views are usable from any thread of the owning process.
    unsafe impl Send for Mapping {}
    // SAFETY: shared access only ever goes through the atomics of `ControlRecord`.
    unsafe impl Sync for Mapping {}

    fn wide(name: &str) -> Vec<u16> {
        name.encode_utf16().chain(std::iter::once(0)).collect()
    }

    fn classify(op: &'static str, name: &str, err: &Error) -> ChannelError {
        let code = err.code();
        if code == ERROR_FILE_NOT_FOUND.to_hresult() {
            ChannelError::NotFound {
                name: name.to_string(),
            }
        } else if code == ERROR_ACCESS_DENIED.to_hresult() {
            ChannelError::AccessDenied {
                name: name.to_string(),
                message: err.message(),
            }
        } else {
            ChannelError::Os {
                op,
                name: name.to_string(),
                message: err.message(),
            }
        }
    }

    impl Mapping {
        pub(crate) fn create(name: &str, size: usize) -> Result<(Self, bool), ChannelError> {
            let name_wide = wide(name);

            unsafe {
                let handle = CreateFileMappingW(
                    INVALID_HANDLE_VALUE,
                    None,
                    PAGE_READWRITE,
                    0,
                    size as u32,
                    PCWSTR(name_wide.as_ptr()),
                )
                .map_err(|e| classify("CreateFileMappingW", name, &e))?;

                let existed = GetLastError() == ERROR_ALREADY_EXISTS;

                let view = MapViewOfFile(handle, FILE_MAP_ALL_ACCESS, 0, 0, size);
                if view.Value.is_null() {
                    let message = GetLastError().to_hresult().message();
                    let _ = CloseHandle(handle);
                    return Err(ChannelError::Os {
                        op: "MapViewOfFile",
                        name: name.to_string(),
                        message,
                    });
                }

                Ok((Self { handle, view }, existed))
            }
        }

        pub(crate) fn open(name: &str, size: usize) -> Result<Self, ChannelError> {
            let name_wide = wide(name);

            unsafe {
                let handle = OpenFileMappingW(FILE_MAP_READ.0, false, PCWSTR(name_wide.as_ptr()))
                    .map_err(|e| classify("OpenFileMappingW", name, &e))?;

                let view = MapViewOfFile(handle, FILE_MAP_READ, 0, 0, size);
                if view.Value.is_null() {
                    let message = GetLastError().to_hresult().message();
                    let _ = CloseHandle(handle);
                    return Err(ChannelError::Os {
                        op: "MapViewOfFile",
                        name: name.to_string(),
                        message,
                    });
                }

                Ok(Self { handle, view })
            }
        }

        pub(crate) fn as_ptr(&self) -> *mut u8 {
            self.view.Value as *mut u8
        }

        // The section is reference counted by the OS.
        pub(crate) fn leave_backing(&mut self) {}
    }

    impl Drop for Mapping {
        fn drop(&mut self) {
            unsafe {
                let _ = UnmapViewOfFile(self.view);
                let _ = CloseHandle(self.handle);
            }
        }
    }
}

#[cfg(not(windows))]
mod imp {
    use crate::ChannelError;
    use memmap2::MmapMut;
    use std::fs::{File, OpenOptions};
    use std::io;
    use std::path::{Path, PathBuf};
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Bytes ahead of the record holding the count of live mappings, in every process.
    /// Keeps the record 64-byte aligned.
    const HEADER_LEN: usize = 64;

    pub(crate) struct Mapping {
        map: MmapMut,
        path: PathBuf,
        // Cleared when the file belongs to a peer that must find it again.
        unlink_when_last: bool,
    }

    fn segment_path(name: &str) -> PathBuf {
        let file_name: String = name
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                    c
                } else {
                    '_'
                }
            })
            .collect();

        let shm = Path::new("/dev/shm");
        let base = if shm.is_dir() {
            shm.to_path_buf()
        } else {
            std::env::temp_dir()
        };
        base.join(file_name)
    }

    fn classify(op: &'static str, name: &str, err: io::Error) -> ChannelError {
        match err.kind() {
            io::ErrorKind::NotFound => ChannelError::NotFound {
                name: name.to_string(),
            },
            io::ErrorKind::PermissionDenied => ChannelError::AccessDenied {
                name: name.to_string(),
                message: err.to_string(),
            },
            _ => ChannelError::Os {
                op,
                name: name.to_string(),
                message: err.to_string(),
            },
        }
    }

    fn map(file: &File, name: &str) -> Result<MmapMut, ChannelError> {
        // SAFETY: the file is a private segment file; concurrent modification by the peer is
        // the point of the mapping and is only observed through atomics.
        unsafe { MmapMut::map_mut(file) }.map_err(|e| classify("mmap", name, e))
    }

    impl Mapping {
        fn new(map: MmapMut, path: PathBuf) -> Self {
            let mapping = Self {
                map,
                path,
                unlink_when_last: true,
            };
            mapping.refs().fetch_add(1, Ordering::AcqRel);
            mapping
        }

        pub(crate) fn create(name: &str, size: usize) -> Result<(Self, bool), ChannelError> {
            let path = segment_path(name);

            let (file, existed) = match OpenOptions::new()
                .read(true)
                .write(true)
                .create_new(true)
                .open(&path)
            {
                Ok(file) => (file, false),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    let file = OpenOptions::new()
                        .read(true)
                        .write(true)
                        .open(&path)
                        .map_err(|e| classify("open", name, e))?;
                    (file, true)
                }
                Err(e) => return Err(classify("create", name, e)),
            };

            let total = (HEADER_LEN + size) as u64;
            let len = file
                .metadata()
                .map_err(|e| classify("stat", name, e))?
                .len();
            if len < total {
                file.set_len(total)
                    .map_err(|e| classify("truncate", name, e))?;
            }

            let map = map(&file, name)?;
            Ok((Self::new(map, path), existed))
        }

        pub(crate) fn open(name: &str, size: usize) -> Result<Self, ChannelError> {
            let path = segment_path(name);
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .open(&path)
                .map_err(|e| classify("open", name, e))?;

            let len = file
                .metadata()
                .map_err(|e| classify("stat", name, e))?
                .len();
            if len < (HEADER_LEN + size) as u64 {
                return Err(ChannelError::Os {
                    op: "open",
                    name: name.to_string(),
                    message: format!("segment is {len} bytes, expected at least {}", HEADER_LEN + size),
                });
            }

            let map = map(&file, name)?;
            Ok(Self::new(map, path))
        }

        fn refs(&self) -> &AtomicU32 {
            // SAFETY: the map is page-aligned and at least HEADER_LEN bytes long.
            unsafe { &*(self.map.as_ptr() as *const AtomicU32) }
        }

        pub(crate) fn as_ptr(&self) -> *mut u8 {
            // SAFETY: the map spans HEADER_LEN + size bytes.
            unsafe { (self.map.as_ptr() as *mut u8).add(HEADER_LEN) }
        }

        pub(crate) fn leave_backing(&mut self) {
            self.unlink_when_last = false;
        }
    }

    impl Drop for Mapping {
        fn drop(&mut self) {
            // Like a section, the name lives as long as any mapping of it, on either side.
            let last = self.refs().fetch_sub(1, Ordering::AcqRel) == 1;
            if last && self.unlink_when_last {
                let _ = std::fs::remove_file(&self.path);
            }
        }
    }
}
