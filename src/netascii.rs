//! NetASCII transcoding for the sending side. `\n` becomes `\r\n` and `\r`
//! becomes `\r\0`. Received netascii data is written out untranslated.

use std::io::{self, ErrorKind, Read};

/// Wraps a byte source and yields its netascii encoding.
///
/// When the second byte of an expansion does not fit in the caller's buffer
/// it is held back and emitted first on the next read.
pub struct NetasciiReader<R> {
    inner: R,
    pending: Option<u8>,
    scratch: Vec<u8>,
}

impl<R: Read> NetasciiReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            pending: None,
            scratch: Vec::new(),
        }
    }
}

impl<R: Read> Read for NetasciiReader<R> {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if out.is_empty() {
            return Ok(0);
        }
        let mut n = 0;
        if let Some(byte) = self.pending.take() {
            out[0] = byte;
            n = 1;
        }

        while n < out.len() {
            // at most one expansion can spill past the end of `out`
            let want = ((out.len() - n) / 2).max(1);
            self.scratch.resize(want, 0);
            let got = match self.inner.read(&mut self.scratch[..want]) {
                Ok(0) => break,
                Ok(got) => got,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            };
            for &byte in &self.scratch[..got] {
                let (first, second) = match byte {
                    b'\n' => (b'\r', Some(b'\n')),
                    b'\r' => (b'\r', Some(0)),
                    other => (other, None),
                };
                out[n] = first;
                n += 1;
                if let Some(second) = second {
                    if n < out.len() {
                        out[n] = second;
                        n += 1;
                    } else {
                        self.pending = Some(second);
                    }
                }
            }
        }
        Ok(n)
    }
}

/// Length of the netascii encoding of everything `source` yields.
pub fn encoded_len<R: Read>(mut source: R) -> io::Result<u64> {
    let mut buf = [0u8; 8192];
    let mut total = 0u64;
    loop {
        let n = match source.read(&mut buf) {
            Ok(0) => return Ok(total),
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        let expanded = buf[..n].iter().filter(|&&b| b == b'\n' || b == b'\r').count();
        total += (n + expanded) as u64;
    }
}
