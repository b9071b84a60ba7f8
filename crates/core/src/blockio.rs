use std::fs::{self, File, OpenOptions};
use std::io;
use std::marker::PhantomData;
use std::path::Path;

use aligned_vec::{AVec, ConstAlign};
use tracing::debug;

/// Offset, length and buffer alignment required by unbuffered handles.
pub const DIRECT_IO_ALIGNMENT: usize = 4096;

type SectorBuf = AVec<u8, ConstAlign<DIRECT_IO_ALIGNMENT>>;

/// Open-time hints for scratch-file I/O.
///
/// `unbuffered` opens a second, cache-bypassing handle (`O_DIRECT`,
/// `F_NOCACHE` or `FILE_FLAG_NO_BUFFERING`) used for every sector-aligned
/// transfer. Filesystems that refuse it fall back to the cached handle, and
/// `BlockReader::bypasses_cache` reports which one is in use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OpenFlags {
    pub unbuffered: bool,
    pub write_through: bool,
    pub sequential: bool,
    pub asynchronous: bool,
}

impl OpenFlags {
    pub const fn write_through() -> Self {
        Self {
            unbuffered: true,
            write_through: true,
            sequential: true,
            asynchronous: false,
        }
    }

    pub const fn sequential_read() -> Self {
        Self {
            unbuffered: true,
            write_through: false,
            sequential: true,
            asynchronous: false,
        }
    }

    pub const fn overlapped_read() -> Self {
        Self {
            asynchronous: true,
            ..Self::sequential_read()
        }
    }
}

pub trait BlockWriter: Send {
    fn write_block(&mut self, data: &[u8]) -> io::Result<()>;

    /// Flushes user-space buffers and forces the data to stable storage.
    fn flush_durable(&mut self) -> io::Result<()>;
}

pub trait BlockReader: Send {
    /// Reads up to `len` bytes from the current position; a short vector
    /// means end of file.
    fn read_block(&mut self, len: usize) -> io::Result<Vec<u8>>;

    /// Issues a single outstanding read at `offset` without moving the
    /// `read_block` cursor. The reader stays borrowed until the read is
    /// waited on or dropped.
    fn read_at_async(&mut self, offset: u64, len: usize) -> io::Result<PendingRead<'_>>;

    /// True when reads are served by the device rather than the page cache.
    fn bypasses_cache(&self) -> bool {
        false
    }
}

/// Block I/O provider used by benchmarks and test cases.
pub trait BlockIo: Send + Sync {
    fn create(&self, path: &Path, flags: OpenFlags) -> io::Result<Box<dyn BlockWriter>>;

    fn open(&self, path: &Path, flags: OpenFlags) -> io::Result<Box<dyn BlockReader>>;

    fn remove(&self, path: &Path) -> io::Result<()> {
        fs::remove_file(path)
    }
}

/// Completion handle for a read issued with `read_at_async`.
pub struct PendingRead<'a> {
    state: PendingState<'a>,
    _reader: PhantomData<&'a mut ()>,
}

enum PendingState<'a> {
    Ready(io::Result<Vec<u8>>),
    #[cfg(windows)]
    Overlapped(overlapped::OverlappedRead<'a>),
    #[cfg(not(windows))]
    #[allow(dead_code)]
    _Marker(std::convert::Infallible, PhantomData<&'a mut ()>),
}

impl<'a> PendingRead<'a> {
    /// Wraps an already-completed result, for providers without real overlap.
    pub fn ready(result: io::Result<Vec<u8>>) -> Self {
        Self {
            state: PendingState::Ready(result),
            _reader: PhantomData,
        }
    }

    #[cfg(windows)]
    fn overlapped(read: overlapped::OverlappedRead<'a>) -> Self {
        Self {
            state: PendingState::Overlapped(read),
            _reader: PhantomData,
        }
    }

    pub fn wait(self) -> io::Result<Vec<u8>> {
        match self.state {
            PendingState::Ready(result) => result,
            #[cfg(windows)]
            PendingState::Overlapped(read) => read.wait(),
            #[cfg(not(windows))]
            PendingState::_Marker(never, _) => match never {},
        }
    }
}

/// Sector-aligned span covering `len` bytes at `offset`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Window {
    start: u64,
    span: usize,
    skip: usize,
    len: usize,
}

impl Window {
    fn covering(offset: u64, len: usize) -> Self {
        let alignment = DIRECT_IO_ALIGNMENT as u64;
        let start = offset - offset % alignment;
        let skip = (offset - start) as usize;
        let span = (skip + len).div_ceil(DIRECT_IO_ALIGNMENT) * DIRECT_IO_ALIGNMENT;
        Self {
            start,
            span,
            skip,
            len,
        }
    }

    /// The requested bytes out of `filled`, which holds what the device
    /// returned for the whole span.
    fn extract(&self, filled: &[u8]) -> Vec<u8> {
        let end = filled.len().min(self.skip + self.len);
        if end <= self.skip {
            Vec::new()
        } else {
            filled[self.skip..end].to_vec()
        }
    }
}

fn grow_to(buffer: &mut SectorBuf, len: usize) {
    while buffer.len() < len {
        buffer.push(0);
    }
}

/// EINVAL / ERROR_INVALID_PARAMETER: the filesystem rejects unbuffered I/O.
fn refuses_direct_io(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::InvalidInput
}

#[cfg(unix)]
fn read_at(file: &File, buffer: &mut [u8], offset: u64) -> io::Result<usize> {
    std::os::unix::fs::FileExt::read_at(file, buffer, offset)
}

#[cfg(windows)]
fn read_at(file: &File, buffer: &mut [u8], offset: u64) -> io::Result<usize> {
    std::os::windows::fs::FileExt::seek_read(file, buffer, offset)
}

#[cfg(unix)]
fn write_at(file: &File, data: &[u8], offset: u64) -> io::Result<usize> {
    std::os::unix::fs::FileExt::write_at(file, data, offset)
}

#[cfg(windows)]
fn write_at(file: &File, data: &[u8], offset: u64) -> io::Result<usize> {
    std::os::windows::fs::FileExt::seek_write(file, data, offset)
}

/// Fills `buffer` from `offset` until it is full or the file ends. An
/// unbuffered handle returns a partial sector only at end of file.
fn read_full_at(file: &File, buffer: &mut [u8], offset: u64, direct: bool) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buffer.len() {
        match read_at(file, &mut buffer[filled..], offset + filled as u64) {
            Ok(0) => break,
            Ok(read) => {
                filled += read;
                if direct && read % DIRECT_IO_ALIGNMENT != 0 {
                    break;
                }
            }
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
    Ok(filled)
}

fn write_all_at(file: &File, data: &[u8], offset: u64) -> io::Result<()> {
    let mut written = 0;
    while written < data.len() {
        match write_at(file, &data[written..], offset + written as u64) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "device accepted no bytes",
                ))
            }
            Ok(count) => written += count,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
    Ok(())
}

#[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
fn open_direct(mut options: OpenOptions, path: &Path, _flags: OpenFlags) -> io::Result<File> {
    use std::os::unix::fs::OpenOptionsExt;

    options.custom_flags(libc::O_DIRECT).open(path)
}

#[cfg(target_os = "macos")]
fn open_direct(options: OpenOptions, path: &Path, _flags: OpenFlags) -> io::Result<File> {
    use std::os::unix::io::AsRawFd;

    let file = options.open(path)?;
    if unsafe { libc::fcntl(file.as_raw_fd(), libc::F_NOCACHE, 1) } == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(file)
}

#[cfg(windows)]
fn open_direct(mut options: OpenOptions, path: &Path, flags: OpenFlags) -> io::Result<File> {
    use std::os::windows::fs::OpenOptionsExt;
    use winapi::um::winbase::FILE_FLAG_NO_BUFFERING;

    options
        .custom_flags(windows_flags(flags) | FILE_FLAG_NO_BUFFERING)
        .open(path)
}

#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    target_os = "freebsd",
    target_os = "macos",
    windows
)))]
fn open_direct(_options: OpenOptions, _path: &Path, _flags: OpenFlags) -> io::Result<File> {
    Err(io::Error::new(
        io::ErrorKind::InvalidInput,
        "unbuffered I/O is not available on this platform",
    ))
}

/// Cache-bypassing companion handle, or `None` when the filesystem refuses it.
fn try_open_direct(options: OpenOptions, path: &Path, flags: OpenFlags) -> io::Result<Option<File>> {
    match open_direct(options, path, flags) {
        Ok(file) => Ok(Some(file)),
        Err(err) if refuses_direct_io(&err) => {
            debug!("unbuffered I/O unavailable for {}: {err}", path.display());
            Ok(None)
        }
        Err(err) => Err(err),
    }
}

#[cfg(windows)]
fn windows_flags(flags: OpenFlags) -> u32 {
    use winapi::um::winbase::{FILE_FLAG_SEQUENTIAL_SCAN, FILE_FLAG_WRITE_THROUGH};

    let mut custom = 0;
    if flags.write_through {
        custom |= FILE_FLAG_WRITE_THROUGH;
    }
    if flags.sequential {
        custom |= FILE_FLAG_SEQUENTIAL_SCAN;
    }
    custom
}

/// Hints applied to the cached handle.
#[cfg(windows)]
fn apply_cached_hints(options: &mut OpenOptions, flags: OpenFlags) {
    use std::os::windows::fs::OpenOptionsExt;

    options.custom_flags(windows_flags(flags));
}

#[cfg(not(windows))]
fn apply_cached_hints(_options: &mut OpenOptions, _flags: OpenFlags) {}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn advise_sequential(file: &File) {
    use std::os::unix::io::AsRawFd;

    let status =
        unsafe { libc::posix_fadvise(file.as_raw_fd(), 0, 0, libc::POSIX_FADV_SEQUENTIAL) };
    if status != 0 {
        debug!("posix_fadvise(SEQUENTIAL) returned {status}");
    }
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn advise_sequential(_file: &File) {}

/// `std::fs` provider with platform cache bypass. Overlapped reads use
/// `ReadFile` with an `OVERLAPPED` record on Windows and positioned reads
/// elsewhere.
#[derive(Debug, Clone, Copy, Default)]
pub struct StdBlockIo;

impl BlockIo for StdBlockIo {
    fn create(&self, path: &Path, flags: OpenFlags) -> io::Result<Box<dyn BlockWriter>> {
        let mut options = OpenOptions::new();
        options.write(true).create(true).truncate(true);
        apply_cached_hints(&mut options, flags);
        let cached = options.open(path)?;

        let direct = if flags.unbuffered {
            let mut options = OpenOptions::new();
            options.write(true);
            try_open_direct(options, path, flags)?
        } else {
            None
        };

        Ok(Box::new(StdWriter {
            cached,
            direct,
            position: 0,
            buffer: SectorBuf::new(DIRECT_IO_ALIGNMENT),
            write_through: flags.write_through,
        }))
    }

    fn open(&self, path: &Path, flags: OpenFlags) -> io::Result<Box<dyn BlockReader>> {
        let mut options = OpenOptions::new();
        options.read(true);
        apply_cached_hints(&mut options, flags);
        let cached = options.open(path)?;
        if flags.sequential {
            advise_sequential(&cached);
        }

        let mut direct = None;
        #[cfg(windows)]
        let mut overlapped = None;
        #[cfg(windows)]
        if flags.asynchronous {
            overlapped = Some(overlapped::open(path, flags)?);
        }
        #[cfg(windows)]
        let needs_direct = flags.unbuffered && overlapped.is_none();
        #[cfg(not(windows))]
        let needs_direct = flags.unbuffered;
        if needs_direct {
            let mut options = OpenOptions::new();
            options.read(true);
            direct = try_open_direct(options, path, flags)?;
        }

        Ok(Box::new(StdReader {
            cached,
            direct,
            #[cfg(windows)]
            overlapped,
            position: 0,
            buffer: SectorBuf::new(DIRECT_IO_ALIGNMENT),
        }))
    }
}

struct StdWriter {
    cached: File,
    direct: Option<File>,
    position: u64,
    buffer: SectorBuf,
    write_through: bool,
}

impl StdWriter {
    /// Writes the sector-aligned prefix of `data` through the unbuffered
    /// handle and returns how many bytes it took.
    fn write_direct_prefix(&mut self, data: &[u8]) -> io::Result<usize> {
        let prefix = data.len() / DIRECT_IO_ALIGNMENT * DIRECT_IO_ALIGNMENT;
        if prefix == 0 || self.position % DIRECT_IO_ALIGNMENT as u64 != 0 {
            return Ok(0);
        }
        let Some(direct) = &self.direct else {
            return Ok(0);
        };
        grow_to(&mut self.buffer, prefix);
        self.buffer[..prefix].copy_from_slice(&data[..prefix]);
        match write_all_at(direct, &self.buffer[..prefix], self.position) {
            Ok(()) => Ok(prefix),
            Err(err) if refuses_direct_io(&err) => {
                debug!("unbuffered write refused, continuing cached: {err}");
                self.direct = None;
                Ok(0)
            }
            Err(err) => Err(err),
        }
    }
}

impl BlockWriter for StdWriter {
    fn write_block(&mut self, data: &[u8]) -> io::Result<()> {
        let done = self.write_direct_prefix(data)?;
        if done < data.len() {
            write_all_at(&self.cached, &data[done..], self.position + done as u64)?;
        }
        self.position += data.len() as u64;
        if self.write_through && !cfg!(windows) {
            self.cached.sync_data()?;
        }
        Ok(())
    }

    fn flush_durable(&mut self) -> io::Result<()> {
        self.cached.sync_all()
    }
}

struct StdReader {
    cached: File,
    direct: Option<File>,
    #[cfg(windows)]
    overlapped: Option<overlapped::OverlappedFile>,
    position: u64,
    buffer: SectorBuf,
}

impl StdReader {
    fn read_at(&mut self, offset: u64, len: usize) -> io::Result<Vec<u8>> {
        if self.direct.is_some() {
            let window = Window::covering(offset, len);
            grow_to(&mut self.buffer, window.span);
            let attempt = match &self.direct {
                Some(direct) => {
                    read_full_at(direct, &mut self.buffer[..window.span], window.start, true)
                }
                None => Ok(0),
            };
            match attempt {
                Ok(filled) => return Ok(window.extract(&self.buffer[..filled])),
                Err(err) if refuses_direct_io(&err) => {
                    debug!("unbuffered read refused, continuing cached: {err}");
                    self.direct = None;
                }
                Err(err) => return Err(err),
            }
        }

        let mut bytes = vec![0_u8; len];
        let filled = read_full_at(&self.cached, &mut bytes, offset, false)?;
        bytes.truncate(filled);
        Ok(bytes)
    }
}

#[cfg(windows)]
impl StdReader {
    fn issue_overlapped(&mut self, offset: u64, len: usize) -> io::Result<PendingRead<'_>> {
        let Self {
            overlapped, buffer, ..
        } = self;
        let Some(file) = overlapped.as_ref() else {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "reader was not opened for overlapped I/O",
            ));
        };
        let window = Window::covering(offset, len);
        grow_to(buffer, window.span);
        let read = overlapped::OverlappedRead::issue(file, &mut buffer[..window.span], window)?;
        Ok(PendingRead::overlapped(read))
    }
}

impl BlockReader for StdReader {
    fn read_block(&mut self, len: usize) -> io::Result<Vec<u8>> {
        let bytes = self.read_at(self.position, len)?;
        self.position += bytes.len() as u64;
        Ok(bytes)
    }

    fn read_at_async(&mut self, offset: u64, len: usize) -> io::Result<PendingRead<'_>> {
        #[cfg(windows)]
        if self.overlapped.is_some() {
            return self.issue_overlapped(offset, len);
        }
        Ok(PendingRead::ready(self.read_at(offset, len)))
    }

    fn bypasses_cache(&self) -> bool {
        #[cfg(windows)]
        if let Some(file) = &self.overlapped {
            return file.unbuffered;
        }
        self.direct.is_some()
    }
}

#[cfg(windows)]
mod overlapped {
    use std::fs::{File, OpenOptions};
    use std::io;
    use std::mem;
    use std::os::windows::fs::OpenOptionsExt;
    use std::os::windows::io::AsRawHandle;
    use std::path::Path;
    use std::ptr;

    use winapi::shared::minwindef::{DWORD, FALSE, TRUE};
    use winapi::shared::winerror::{ERROR_HANDLE_EOF, ERROR_IO_PENDING};
    use winapi::um::fileapi::ReadFile;
    use winapi::um::handleapi::CloseHandle;
    use winapi::um::ioapiset::GetOverlappedResult;
    use winapi::um::minwinbase::OVERLAPPED;
    use winapi::um::synchapi::CreateEventW;
    use winapi::um::winbase::{FILE_FLAG_NO_BUFFERING, FILE_FLAG_OVERLAPPED};
    use winapi::um::winnt::HANDLE;

    use super::{refuses_direct_io, windows_flags, OpenFlags, Window};

    /// Handle opened with `FILE_FLAG_OVERLAPPED`; only `ReadFile` touches it.
    pub struct OverlappedFile {
        file: File,
        pub unbuffered: bool,
    }

    pub fn open(path: &Path, flags: OpenFlags) -> io::Result<OverlappedFile> {
        let base = windows_flags(flags) | FILE_FLAG_OVERLAPPED;
        if flags.unbuffered {
            match OpenOptions::new()
                .read(true)
                .custom_flags(base | FILE_FLAG_NO_BUFFERING)
                .open(path)
            {
                Ok(file) => {
                    return Ok(OverlappedFile {
                        file,
                        unbuffered: true,
                    })
                }
                Err(err) if refuses_direct_io(&err) => {}
                Err(err) => return Err(err),
            }
        }
        let file = OpenOptions::new().read(true).custom_flags(base).open(path)?;
        Ok(OverlappedFile {
            file,
            unbuffered: false,
        })
    }

    fn raw(file: &File) -> HANDLE {
        file.as_raw_handle() as HANDLE
    }

    pub struct OverlappedRead<'a> {
        file: &'a File,
        buffer: &'a mut [u8],
        record: Box<OVERLAPPED>,
        window: Window,
        in_flight: bool,
    }

    impl<'a> OverlappedRead<'a> {
        pub fn issue(
            file: &'a OverlappedFile,
            buffer: &'a mut [u8],
            window: Window,
        ) -> io::Result<Self> {
            let event = unsafe { CreateEventW(ptr::null_mut(), TRUE, FALSE, ptr::null()) };
            if event.is_null() {
                return Err(io::Error::last_os_error());
            }
            let mut record: Box<OVERLAPPED> = Box::new(unsafe { mem::zeroed() });
            unsafe {
                let position = record.u.s_mut();
                position.Offset = window.start as DWORD;
                position.OffsetHigh = (window.start >> 32) as DWORD;
            }
            record.hEvent = event;

            let mut read = Self {
                file: &file.file,
                buffer,
                record,
                window,
                in_flight: false,
            };
            let issued = unsafe {
                ReadFile(
                    raw(read.file),
                    read.buffer.as_mut_ptr().cast(),
                    read.buffer.len() as DWORD,
                    ptr::null_mut(),
                    &mut *read.record,
                )
            };
            if issued == 0 {
                let err = io::Error::last_os_error();
                match err.raw_os_error().map(|code| code as DWORD) {
                    Some(ERROR_IO_PENDING) => {}
                    Some(ERROR_HANDLE_EOF) => return Ok(read),
                    _ => return Err(err),
                }
            }
            read.in_flight = true;
            Ok(read)
        }

        pub fn wait(mut self) -> io::Result<Vec<u8>> {
            let mut transferred: DWORD = 0;
            if self.in_flight {
                let completed = unsafe {
                    GetOverlappedResult(
                        raw(self.file),
                        &mut *self.record,
                        &mut transferred,
                        TRUE,
                    )
                };
                self.in_flight = false;
                if completed == 0 {
                    let err = io::Error::last_os_error();
                    if err.raw_os_error().map(|code| code as DWORD) != Some(ERROR_HANDLE_EOF) {
                        return Err(err);
                    }
                    transferred = 0;
                }
            }
            let filled = (transferred as usize).min(self.buffer.len());
            Ok(self.window.extract(&self.buffer[..filled]))
        }
    }

    impl Drop for OverlappedRead<'_> {
        fn drop(&mut self) {
            // The kernel owns `buffer` and `record` until the request completes.
            if self.in_flight {
                let mut transferred: DWORD = 0;
                unsafe {
                    GetOverlappedResult(raw(self.file), &mut *self.record, &mut transferred, TRUE);
                }
            }
            unsafe {
                CloseHandle(self.record.hEvent);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{BlockIo, OpenFlags, PendingRead, StdBlockIo, Window, DIRECT_IO_ALIGNMENT};

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|index| (index % 251) as u8).collect()
    }

    #[test]
    fn sync_and_overlapped_reads_return_written_bytes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("blocks.bin");
        let io = StdBlockIo;

        let mut writer = io.create(&path, OpenFlags::write_through()).expect("create");
        writer.write_block(&[1_u8; 4096]).expect("write 1");
        writer.write_block(&[2_u8; 4096]).expect("write 2");
        writer.flush_durable().expect("flush");
        drop(writer);

        let mut reader = io.open(&path, OpenFlags::sequential_read()).expect("open");
        let first = reader.read_block(4096).expect("read");
        assert!(first.iter().all(|byte| *byte == 1));

        let mut reader = io.open(&path, OpenFlags::overlapped_read()).expect("open");
        let second = reader
            .read_at_async(4096, 4096)
            .expect("issue")
            .wait()
            .expect("complete");
        assert_eq!(second.len(), 4096);
        assert!(second.iter().all(|byte| *byte == 2));

        let tail = reader
            .read_at_async(8000, 4096)
            .expect("issue")
            .wait()
            .expect("complete");
        assert_eq!(tail.len(), 192);
    }

    #[test]
    fn unaligned_sizes_survive_the_unbuffered_path() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("odd.bin");
        let io = StdBlockIo;
        let data = pattern(3 * DIRECT_IO_ALIGNMENT + 777);

        let mut writer = io.create(&path, OpenFlags::write_through()).expect("create");
        writer.write_block(&data[..DIRECT_IO_ALIGNMENT + 10]).expect("write head");
        writer.write_block(&data[DIRECT_IO_ALIGNMENT + 10..]).expect("write rest");
        writer.flush_durable().expect("flush");
        drop(writer);
        assert_eq!(std::fs::read(&path).expect("plain read"), data);

        let mut reader = io.open(&path, OpenFlags::sequential_read()).expect("open");
        let head = reader.read_block(100).expect("head");
        let rest = reader.read_block(data.len()).expect("rest");
        assert_eq!(head, data[..100]);
        assert_eq!(rest, data[100..]);
        assert!(reader.read_block(10).expect("eof").is_empty());

        let mut reader = io.open(&path, OpenFlags::sequential_read()).expect("open");
        assert_eq!(reader.read_block(data.len() + 1).expect("whole"), data);
    }

    #[test]
    fn overlapped_reads_leave_the_cursor_alone() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("cursor.bin");
        let data = pattern(2 * DIRECT_IO_ALIGNMENT);
        std::fs::write(&path, &data).expect("seed");

        let mut reader = StdBlockIo
            .open(&path, OpenFlags::overlapped_read())
            .expect("open");
        let middle = reader
            .read_at_async(5000, 300)
            .expect("issue")
            .wait()
            .expect("complete");
        assert_eq!(middle, data[5000..5300]);
        assert_eq!(reader.read_block(16).expect("cursor"), data[..16]);
    }

    #[test]
    fn cached_flags_never_claim_to_bypass_the_cache() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("plain.bin");
        std::fs::write(&path, pattern(64)).expect("seed");
        let reader = StdBlockIo.open(&path, OpenFlags::default()).expect("open");
        assert!(!reader.bypasses_cache());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn unbuffered_reader_uses_o_direct_where_the_filesystem_allows_it() {
        use std::os::unix::fs::OpenOptionsExt;

        let dir = tempfile::tempdir_in(env!("CARGO_MANIFEST_DIR")).expect("tempdir");
        let path = dir.path().join("direct.bin");
        std::fs::write(&path, pattern(2 * DIRECT_IO_ALIGNMENT)).expect("seed");

        let supported = std::fs::OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_DIRECT)
            .open(&path)
            .is_ok();
        let mut reader = StdBlockIo
            .open(&path, OpenFlags::sequential_read())
            .expect("open");
        assert_eq!(reader.bypasses_cache(), supported);
        assert_eq!(
            reader.read_block(2 * DIRECT_IO_ALIGNMENT).expect("read"),
            pattern(2 * DIRECT_IO_ALIGNMENT)
        );
    }

    #[test]
    fn windows_cover_requests_with_whole_sectors() {
        let window = Window::covering(5000, 300);
        assert_eq!(window.start, 4096);
        assert_eq!(window.skip, 904);
        assert_eq!(window.span, DIRECT_IO_ALIGNMENT);

        let straddling = Window::covering(4000, 200);
        assert_eq!(straddling.start, 0);
        assert_eq!(straddling.span, 2 * DIRECT_IO_ALIGNMENT);

        let filled = pattern(4096 + 950);
        assert_eq!(window.extract(&filled), filled[904..1204]);
        assert_eq!(window.extract(&filled[..1000]), filled[904..1000]);
        assert!(window.extract(&filled[..900]).is_empty());
    }

    #[test]
    fn ready_handle_yields_its_result() {
        let bytes = PendingRead::ready(Ok(vec![7, 7])).wait().expect("ready");
        assert_eq!(bytes, vec![7, 7]);
    }
}
