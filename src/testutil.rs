//! Test doubles shared by the unit tests

use std::collections::HashMap;
use std::io;
use std::sync::{Condvar, Mutex};

use crate::store::Origin;

/// In-memory origin that counts reads per offset
pub struct MemOrigin {
    path: String,
    data: Vec<u8>,
    reads: Mutex<Vec<(u64, usize)>>,
    fail_at: Option<u64>,
    interrupt_once: Mutex<bool>,
    gate: Mutex<bool>,
    gate_cond: Condvar,
}

impl MemOrigin {
    pub fn new(path: &str, len: usize) -> Self {
        let data = (0..len).map(|i| (i % 251) as u8).collect();
        Self {
            path: path.to_string(),
            data,
            reads: Mutex::new(Vec::new()),
            fail_at: None,
            interrupt_once: Mutex::new(false),
            gate: Mutex::new(true),
            gate_cond: Condvar::new(),
        }
    }

    /// Reads touching `offset` fail with a non-retryable error
    pub fn failing_at(mut self, offset: u64) -> Self {
        self.fail_at = Some(offset);
        self
    }

    /// The first read returns `Interrupted`
    pub fn interrupting_once(self) -> Self {
        *self.interrupt_once.lock().unwrap() = true;
        self
    }

    /// Hold every read until [`open_gate`](Self::open_gate) is called
    pub fn gated(self) -> Self {
        *self.gate.lock().unwrap() = false;
        self
    }

    pub fn open_gate(&self) {
        *self.gate.lock().unwrap() = true;
        self.gate_cond.notify_all();
    }

    pub fn expected(&self, offset: u64, len: usize) -> Vec<u8> {
        let start = offset as usize;
        let end = (start + len).min(self.data.len());
        self.data[start..end].to_vec()
    }

    /// Every (offset, len) read so far, in call order
    pub fn reads(&self) -> Vec<(u64, usize)> {
        self.reads.lock().unwrap().clone()
    }

    /// Reads per starting offset
    pub fn read_counts(&self) -> HashMap<u64, usize> {
        let mut counts = HashMap::new();
        for (offset, _) in self.reads() {
            *counts.entry(offset).or_insert(0) += 1;
        }
        counts
    }
}

impl Origin for MemOrigin {
    fn path(&self) -> &str {
        &self.path
    }

    fn len(&self) -> io::Result<u64> {
        Ok(self.data.len() as u64)
    }

    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        {
            let mut open = self.gate.lock().unwrap();
            while !*open {
                open = self.gate_cond.wait(open).unwrap();
            }
        }
        {
            let mut interrupt = self.interrupt_once.lock().unwrap();
            if *interrupt {
                *interrupt = false;
                return Err(io::Error::from(io::ErrorKind::Interrupted));
            }
        }
        if let Some(bad) = self.fail_at {
            if bad >= offset && bad < offset + buf.len() as u64 {
                return Err(io::Error::new(io::ErrorKind::ConnectionReset, "origin went away"));
            }
        }
        self.reads.lock().unwrap().push((offset, buf.len()));

        let start = (offset as usize).min(self.data.len());
        let end = (start + buf.len()).min(self.data.len());
        let n = end - start;
        buf[..n].copy_from_slice(&self.data[start..end]);
        Ok(n)
    }
}
