//! Parsing and playback of allocator request scripts.
//!
//! A script is a text file, one request per line:
//!
//! ```text
//! # ids are arbitrary integers, locally unique
//! a 1 2048
//! r 1 4096
//! f 1
//! ```
//!
//! `a ID BYTES` allocates and remembers the pointer under ID, `r ID BYTES`
//! reallocates it, `f ID` releases it. `#` starts a comment; blank lines are
//! skipped; execution is strictly in order.
//!
//! The [`Player`] drives a heap from a parsed script, stamping every
//! allocation with an id-derived byte pattern and verifying the stamp before
//! the pointer is resized or released. Blocks that overlap, or that a move
//! failed to copy, surface as corruption rather than as quiet bookkeeping
//! drift.
//!
//! [`Player`]: struct.Player.html

extern crate fit_alloc;
extern crate memory_units;

use std::cmp;
use std::collections::HashMap;
use std::error;
use std::fmt;
use std::ptr;
use std::slice;

use fit_alloc::{FitAlloc, FreeIndex, WORD_SIZE};
use memory_units::Bytes;

/// One line of a request script.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request {
    /// `a ID BYTES`: allocate BYTES, remember the pointer under ID.
    Allocate {
        /// The script-local handle.
        id: i64,
        /// Requested size.
        bytes: usize,
    },
    /// `r ID BYTES`: reallocate the pointer under ID, replacing it.
    Reallocate {
        /// The script-local handle.
        id: i64,
        /// Requested size.
        bytes: usize,
    },
    /// `f ID`: release the pointer under ID.
    Release {
        /// The script-local handle.
        id: i64,
    },
}

/// A malformed script line.
#[derive(Debug)]
pub struct ParseError {
    /// 1-based line number.
    pub line: usize,
    /// What was wrong with it.
    pub what: String,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "line {}: {}", self.line, self.what)
    }
}

impl error::Error for ParseError {}

fn field<T: ::std::str::FromStr>(
    word: Option<&str>,
    line: usize,
    what: &str,
) -> Result<T, ParseError> {
    match word.and_then(|w| w.parse().ok()) {
        Some(value) => Ok(value),
        None => Err(ParseError {
            line: line,
            what: format!("expected {}", what),
        }),
    }
}

/// Parse a whole script.
pub fn parse(text: &str) -> Result<Vec<Request>, ParseError> {
    let mut requests = Vec::new();
    for (idx, raw) in text.lines().enumerate() {
        let line = idx + 1;
        let body = raw.split('#').next().unwrap_or("");
        let mut words = body.split_whitespace();
        let op = match words.next() {
            None => continue,
            Some(op) => op,
        };
        let request = match op {
            "a" => Request::Allocate {
                id: field(words.next(), line, "an id")?,
                bytes: field(words.next(), line, "a byte count")?,
            },
            "r" => Request::Reallocate {
                id: field(words.next(), line, "an id")?,
                bytes: field(words.next(), line, "a byte count")?,
            },
            "f" => Request::Release {
                id: field(words.next(), line, "an id")?,
            },
            other => {
                return Err(ParseError {
                    line: line,
                    what: format!("unknown request '{}'", other),
                })
            }
        };
        if words.next().is_some() {
            return Err(ParseError {
                line: line,
                what: "trailing fields".to_string(),
            });
        }
        requests.push(request);
    }
    Ok(requests)
}

/// An owned, word-aligned byte buffer suitable for hosting a heap.
pub struct Region {
    storage: Vec<usize>,
}

impl Region {
    /// A region of at least `bytes`, rounded up to whole words.
    pub fn new(bytes: usize) -> Region {
        let words = (bytes + WORD_SIZE - 1) / WORD_SIZE;
        Region {
            storage: vec![0; words],
        }
    }

    /// The region's size in bytes.
    pub fn bytes(&self) -> usize {
        self.storage.len() * WORD_SIZE
    }

    /// The region's base address.
    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.storage.as_mut_ptr() as *mut u8
    }
}

/// A request the heap could not honor, or a heap that stopped validating.
#[derive(Debug)]
pub struct PlayError {
    /// 0-based index of the failing request.
    pub request: usize,
    /// What went wrong.
    pub what: String,
}

impl fmt::Display for PlayError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "request {}: {}", self.request, self.what)
    }
}

impl error::Error for PlayError {}

#[derive(Debug, Clone, Copy)]
struct Slot {
    ptr: usize,
    bytes: usize,
}

fn stamp_byte(id: i64) -> u8 {
    (id as u8) ^ 0xa5
}

fn stamp(ptr: *mut u8, bytes: usize, id: i64) {
    unsafe { ptr::write_bytes(ptr, stamp_byte(id), bytes) }
}

fn stamp_intact(ptr: *const u8, bytes: usize, id: i64) -> bool {
    let want = stamp_byte(id);
    unsafe { slice::from_raw_parts(ptr, bytes).iter().all(|b| *b == want) }
}

/// Drives a heap from a request list, tracking the id table and the byte
/// stamps.
pub struct Player<'a, I: FreeIndex> {
    heap: FitAlloc<'a, I>,
    table: HashMap<i64, Slot>,
    /// Run the full validator after every request. On by default.
    pub validate_each: bool,
}

impl<'a, I: FreeIndex> Player<'a, I> {
    /// Wrap a freshly initialized heap.
    pub fn new(heap: FitAlloc<'a, I>) -> Player<'a, I> {
        Player {
            heap: heap,
            table: HashMap::new(),
            validate_each: true,
        }
    }

    /// The heap being driven.
    pub fn heap(&self) -> &FitAlloc<'a, I> {
        &self.heap
    }

    /// Play every request in order.
    pub fn play(&mut self, requests: &[Request]) -> Result<(), PlayError> {
        for (i, request) in requests.iter().enumerate() {
            self.step(i, *request)?;
        }
        Ok(())
    }

    fn fail(&self, i: usize, what: String) -> PlayError {
        PlayError {
            request: i,
            what: what,
        }
    }

    fn step(&mut self, i: usize, request: Request) -> Result<(), PlayError> {
        match request {
            Request::Allocate { id, bytes } => {
                let ptr = self.heap.allocate(Bytes(bytes));
                if ptr.is_null() && bytes > 0 {
                    return Err(self.fail(i, format!("allocation of {} bytes failed", bytes)));
                }
                if !ptr.is_null() {
                    stamp(ptr, bytes, id);
                }
                self.table.insert(
                    id,
                    Slot {
                        ptr: ptr as usize,
                        bytes: bytes,
                    },
                );
            }
            Request::Reallocate { id, bytes } => {
                let old = self.table.get(&id).cloned().unwrap_or(Slot { ptr: 0, bytes: 0 });
                if old.ptr != 0 && !stamp_intact(old.ptr as *const u8, old.bytes, id) {
                    return Err(self.fail(i, format!("id {} corrupted before reallocate", id)));
                }
                let ptr = unsafe { self.heap.reallocate(old.ptr as *mut u8, Bytes(bytes)) };
                if bytes == 0 {
                    self.table.remove(&id);
                } else {
                    if ptr.is_null() {
                        return Err(self.fail(
                            i,
                            format!("reallocation of id {} to {} bytes failed", id, bytes),
                        ));
                    }
                    if old.ptr != 0
                        && !stamp_intact(ptr, cmp::min(old.bytes, bytes), id)
                    {
                        return Err(self.fail(
                            i,
                            format!("id {} lost its prefix across reallocate", id),
                        ));
                    }
                    stamp(ptr, bytes, id);
                    self.table.insert(
                        id,
                        Slot {
                            ptr: ptr as usize,
                            bytes: bytes,
                        },
                    );
                }
            }
            Request::Release { id } => match self.table.remove(&id) {
                None => {
                    return Err(self.fail(i, format!("release of unknown id {}", id)));
                }
                Some(slot) => {
                    if slot.ptr != 0 {
                        if !stamp_intact(slot.ptr as *const u8, slot.bytes, id) {
                            return Err(
                                self.fail(i, format!("id {} corrupted before release", id))
                            );
                        }
                        unsafe { self.heap.release(slot.ptr as *mut u8) };
                    }
                }
            },
        }
        if self.validate_each && !self.heap.validate() {
            return Err(self.fail(i, "heap invariants violated".to_string()));
        }
        Ok(())
    }
}

/// Outcome summary of a full script run.
#[derive(Debug, Clone, Copy)]
pub struct Outcome {
    /// Requests played.
    pub requests: usize,
    /// `capacity()` after the last request, in bytes.
    pub final_capacity: usize,
}

/// Host a fresh heap of `heap_bytes` in an owned region and play `requests`
/// against it, calling `observe` after every request.
pub fn run_script<I, F>(
    requests: &[Request],
    heap_bytes: usize,
    validate_each: bool,
    mut observe: F,
) -> Result<Outcome, PlayError>
where
    I: FreeIndex,
    F: FnMut(usize, &FitAlloc<I>),
{
    let mut region = Region::new(heap_bytes);
    let size = Bytes(region.bytes());
    let heap = match unsafe { FitAlloc::init(region.as_mut_ptr(), size) } {
        Ok(heap) => heap,
        Err(e) => {
            return Err(PlayError {
                request: 0,
                what: format!("init failed: {}", e),
            })
        }
    };
    let mut player = Player::new(heap);
    player.validate_each = validate_each;
    for (i, request) in requests.iter().enumerate() {
        player.step(i, *request)?;
        observe(i, player.heap());
    }
    let final_capacity = player.heap().capacity().0;
    Ok(Outcome {
        requests: requests.len(),
        final_capacity: final_capacity,
    })
}
