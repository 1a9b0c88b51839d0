//! Zero-copy array views over worker-created shared-memory segments.
//!
//! The worker copies a contiguous row-major numeric array into a fresh
//! named POSIX segment and sends back only the segment name plus shape and
//! dtype. The client maps the segment and exposes a typed view; the bytes
//! never cross the wire. The client owns disposal: the segment is unlinked
//! when the [`SharedArray`] drops unless [`SharedArray::into_leaked`] was
//! called.

use crate::error::{Error, Result};

/// Element types the worker can hand over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dtype {
    Bool,
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    I64,
    U64,
    F32,
    F64,
}

impl Dtype {
    /// Size of one element in bytes.
    pub fn item_size(self) -> usize {
        match self {
            Dtype::Bool | Dtype::I8 | Dtype::U8 => 1,
            Dtype::I16 | Dtype::U16 => 2,
            Dtype::I32 | Dtype::U32 | Dtype::F32 => 4,
            Dtype::I64 | Dtype::U64 | Dtype::F64 => 8,
        }
    }

    /// The numpy spelling, e.g. `float32`.
    pub fn name(self) -> &'static str {
        match self {
            Dtype::Bool => "bool",
            Dtype::I8 => "int8",
            Dtype::U8 => "uint8",
            Dtype::I16 => "int16",
            Dtype::U16 => "uint16",
            Dtype::I32 => "int32",
            Dtype::U32 => "uint32",
            Dtype::I64 => "int64",
            Dtype::U64 => "uint64",
            Dtype::F32 => "float32",
            Dtype::F64 => "float64",
        }
    }
}

impl std::str::FromStr for Dtype {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "bool" => Dtype::Bool,
            "int8" => Dtype::I8,
            "uint8" => Dtype::U8,
            "int16" => Dtype::I16,
            "uint16" => Dtype::U16,
            "int32" => Dtype::I32,
            "uint32" => Dtype::U32,
            "int64" => Dtype::I64,
            "uint64" => Dtype::U64,
            "float32" => Dtype::F32,
            "float64" => Dtype::F64,
            other => return Err(Error::Protocol(format!("unsupported array dtype '{other}'"))),
        })
    }
}

/// Marker trait mapping Rust element types onto [`Dtype`]s for typed views.
pub trait Element: sealed::Sealed {
    const DTYPE: Dtype;
}

mod sealed {
    pub trait Sealed {}
}

macro_rules! element {
    ($ty:ty, $dtype:expr) => {
        impl sealed::Sealed for $ty {}
        impl Element for $ty {
            const DTYPE: Dtype = $dtype;
        }
    };
}

element!(i8, Dtype::I8);
element!(u8, Dtype::U8);
element!(i16, Dtype::I16);
element!(u16, Dtype::U16);
element!(i32, Dtype::I32);
element!(u32, Dtype::U32);
element!(i64, Dtype::I64);
element!(u64, Dtype::U64);
element!(f32, Dtype::F32);
element!(f64, Dtype::F64);

/// A read-only array view backed by a mapped shared-memory segment.
pub struct SharedArray {
    name: String,
    shape: Vec<usize>,
    dtype: Dtype,
    #[cfg(unix)]
    map: memmap2::Mmap,
    unlink_on_drop: bool,
}

impl std::fmt::Debug for SharedArray {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedArray")
            .field("name", &self.name)
            .field("shape", &self.shape)
            .field("dtype", &self.dtype.name())
            .finish()
    }
}

#[cfg(unix)]
fn segment_cname(name: &str) -> Result<std::ffi::CString> {
    // multiprocessing.shared_memory reports names without the leading slash.
    let posix_name = if name.starts_with('/') {
        name.to_string()
    } else {
        format!("/{name}")
    };
    std::ffi::CString::new(posix_name)
        .map_err(|_| Error::Protocol("segment name contains a NUL byte".to_string()))
}

impl SharedArray {
    /// Maps the named segment and validates it is large enough for
    /// `shape` × `dtype`.
    #[cfg(unix)]
    pub(crate) fn attach(name: &str, shape: Vec<usize>, dtype: Dtype) -> Result<Self> {
        use std::os::fd::FromRawFd;

        let byte_len = shape
            .iter()
            .try_fold(dtype.item_size(), |acc, &dim| acc.checked_mul(dim))
            .ok_or_else(|| Error::Protocol("array byte length overflows".to_string()))?;

        let cname = segment_cname(name)?;
        let fd = unsafe { libc::shm_open(cname.as_ptr(), libc::O_RDONLY, 0) };
        if fd < 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        let file = unsafe { std::fs::File::from_raw_fd(fd) };
        let actual = file.metadata()?.len() as usize;
        if actual < byte_len {
            return Err(Error::Protocol(format!(
                "segment '{name}' holds {actual} bytes, array needs {byte_len}"
            )));
        }
        let map = unsafe { memmap2::Mmap::map(&file)? };
        Ok(Self {
            name: name.to_string(),
            shape,
            dtype,
            map,
            unlink_on_drop: true,
        })
    }

    #[cfg(not(unix))]
    pub(crate) fn attach(_name: &str, _shape: Vec<usize>, _dtype: Dtype) -> Result<Self> {
        Err(Error::Unsupported(
            "shared-memory arrays are only supported on POSIX platforms",
        ))
    }

    /// The segment name as reported by the worker.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn dtype(&self) -> Dtype {
        self.dtype
    }

    /// Total number of elements.
    pub fn len(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The raw element bytes, row-major.
    #[cfg(unix)]
    pub fn as_bytes(&self) -> &[u8] {
        &self.map[..self.len() * self.dtype.item_size()]
    }

    /// A typed flat view. `None` when `T` does not match the dtype or the
    /// mapping is misaligned for `T`.
    #[cfg(unix)]
    pub fn as_slice<T: Element>(&self) -> Option<&[T]> {
        if T::DTYPE != self.dtype {
            return None;
        }
        let (prefix, elements, _) = unsafe { self.as_bytes().align_to::<T>() };
        if !prefix.is_empty() || elements.len() < self.len() {
            return None;
        }
        Some(&elements[..self.len()])
    }

    /// Keeps the backing segment alive after drop; the caller becomes
    /// responsible for unlinking it.
    pub fn into_leaked(mut self) -> Self {
        self.unlink_on_drop = false;
        self
    }
}

impl Drop for SharedArray {
    fn drop(&mut self) {
        #[cfg(unix)]
        if self.unlink_on_drop
            && let Ok(cname) = segment_cname(&self.name)
        {
            unsafe {
                libc::shm_unlink(cname.as_ptr());
            }
        }
    }
}
