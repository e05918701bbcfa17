//! RWX host code buffer: the destination for every emitted template.
//!
//! Backed by an anonymous `mmap` region per §4.6/§9 ("Scoped RWX memory"):
//! acquired for one compile-then-execute cycle and released when the
//! `JitBuffer` is dropped. This mirrors `r5jit_mem.c`'s POSIX path; the
//! reference design assumes RWX is available on the host, which is true
//! of every Linux/BSD/macOS x86-32 target this crate is built for.

use crate::error::JitError;

pub struct JitBuffer {
    ptr: *mut u8,
    capacity: usize,
    pos: usize,
    error: bool,
}

fn page_size() -> usize {
    // SAFETY: sysconf with a valid, universally supported name never
    // fails in a way that matters here; a 0 or negative result would
    // only occur for genuinely unsupported names.
    let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if sz > 0 {
        sz as usize
    } else {
        4096
    }
}

fn round_up_to_page(bytes: usize) -> usize {
    let page = page_size();
    ((bytes + page - 1) / page) * page
}

impl JitBuffer {
    /// Allocate `bytes` (rounded up to page granularity) of read+write+
    /// execute host memory.
    pub fn alloc(bytes: usize) -> Result<JitBuffer, JitError> {
        let rounded = round_up_to_page(bytes.max(1));
        // SAFETY: MAP_PRIVATE|MAP_ANONYMOUS with no backing fd is always
        // a valid mmap request; the result is checked against MAP_FAILED
        // before use.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                rounded,
                libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(JitError::Alloc { bytes: rounded });
        }
        Ok(JitBuffer {
            ptr: ptr as *mut u8,
            capacity: rounded,
            pos: 0,
            error: false,
        })
    }

    pub fn pos(&self) -> usize {
        self.pos
    }

    pub fn has_error(&self) -> bool {
        self.error
    }

    /// Host address of the next byte that will be written — what the
    /// dispatch table records for the instruction about to be emitted.
    pub fn cursor_host_addr(&self) -> u32 {
        (self.ptr as usize + self.pos) as u32
    }

    /// Host address of the buffer's first byte — the entry point passed
    /// to the driver once compilation finishes.
    pub fn base_host_addr(&self) -> u32 {
        self.ptr as u32
    }

    pub fn emit_u8(&mut self, byte: u8) {
        if self.error {
            return;
        }
        if self.pos >= self.capacity {
            self.error = true;
            return;
        }
        // SAFETY: pos < capacity was just checked, and ptr is valid for
        // `capacity` writable bytes for the lifetime of this buffer.
        unsafe { *self.ptr.add(self.pos) = byte };
        self.pos += 1;
    }

    pub fn emit_u32_le(&mut self, value: u32) {
        for b in value.to_le_bytes() {
            self.emit_u8(b);
        }
    }

    pub fn emit_bytes(&mut self, bytes: &[u8]) {
        for b in bytes {
            self.emit_u8(*b);
        }
    }

    /// Cast the buffer's entry point to a nullary callable and invoke it.
    /// Only sound once compilation finished without error and the prolog
    /// pinned a valid base pointer at the very first emitted byte.
    ///
    /// # Safety
    /// The caller must ensure the buffer holds a complete, correctly
    /// emitted program ending in a `ret`, and that nothing else mutates
    /// this buffer's memory concurrently.
    pub unsafe fn call_entry(&self) {
        let entry: extern "C" fn() = std::mem::transmute(self.ptr);
        entry();
    }

    /// Debug helper: dump the raw emitted bytes for offline disassembly,
    /// e.g. `objdump -D -b binary -mi386 -M intel jit.bin`.
    pub fn dump(&self, path: &std::path::Path) -> std::io::Result<()> {
        // SAFETY: ptr is valid for `pos` initialized bytes.
        let slice = unsafe { std::slice::from_raw_parts(self.ptr, self.pos) };
        std::fs::write(path, slice)
    }
}

impl Drop for JitBuffer {
    fn drop(&mut self) {
        // SAFETY: ptr/capacity come from a successful mmap of exactly
        // this size in `alloc`, and no other reference to it survives
        // this buffer.
        unsafe {
            libc::munmap(self.ptr as *mut libc::c_void, self.capacity);
        }
    }
}
