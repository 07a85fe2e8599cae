//! Safe LZO1X decompression.
//!
//! No crate in the supported dependency set covers LZO1X, so the
//! decoder lives here: a bounds-checked port of the classic state
//! machine. The format interleaves literal runs and back-references;
//! the low two bits of each match's final control byte say how many
//! literals follow it directly, and the stream ends with a
//! zero-distance far-match marker (`0x11 0x00 0x00`).

use std::fmt;

/// Decoder failure causes; all map to a decode error at the dispatch
/// layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LzoError {
    /// Input ran out mid-token.
    InputOverrun,
    /// Output buffer too small for the decoded stream.
    OutputOverrun,
    /// A match points before the start of the output.
    LookbehindOverrun,
    /// The end-of-stream marker arrived before the input was consumed.
    TrailingInput,
    /// The input ended without an end-of-stream marker.
    MissingEndMarker,
}

impl fmt::Display for LzoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::InputOverrun => "input overrun",
            Self::OutputOverrun => "output overrun",
            Self::LookbehindOverrun => "lookbehind overrun",
            Self::TrailingInput => "trailing bytes after end marker",
            Self::MissingEndMarker => "missing end-of-stream marker",
        };
        f.write_str(text)
    }
}

struct Decoder<'a> {
    input: &'a [u8],
    out: &'a mut [u8],
    ip: usize,
    op: usize,
}

impl<'a> Decoder<'a> {
    fn byte(&mut self) -> Result<usize, LzoError> {
        let b = *self.input.get(self.ip).ok_or(LzoError::InputOverrun)?;
        self.ip += 1;
        Ok(usize::from(b))
    }

    /// Zero-byte run-length extension: each 0x00 adds 255.
    fn extended_count(&mut self, base: usize) -> Result<usize, LzoError> {
        let mut count = base;
        loop {
            let b = self.byte()?;
            if b != 0 {
                return Ok(count + b);
            }
            count = count.checked_add(255).ok_or(LzoError::InputOverrun)?;
        }
    }

    fn le16(&mut self) -> Result<usize, LzoError> {
        let lo = self.byte()?;
        let hi = self.byte()?;
        Ok(hi << 8 | lo)
    }

    fn copy_literals(&mut self, count: usize) -> Result<(), LzoError> {
        let in_end = self.ip.checked_add(count).ok_or(LzoError::InputOverrun)?;
        if in_end > self.input.len() {
            return Err(LzoError::InputOverrun);
        }
        let out_end = self.op.checked_add(count).ok_or(LzoError::OutputOverrun)?;
        if out_end > self.out.len() {
            return Err(LzoError::OutputOverrun);
        }
        self.out[self.op..out_end].copy_from_slice(&self.input[self.ip..in_end]);
        self.ip = in_end;
        self.op = out_end;
        Ok(())
    }

    /// Consume a literal-run token (< 16), copy the run, and return the
    /// token that follows it.
    fn literal_run(&mut self, run_token: usize) -> Result<usize, LzoError> {
        let run = if run_token == 0 {
            self.extended_count(15)?
        } else {
            run_token
        };
        self.copy_literals(run + 3)?;
        self.byte()
    }

    /// Byte-wise forward copy so overlapping matches replicate correctly.
    fn copy_match(&mut self, distance: usize, count: usize) -> Result<(), LzoError> {
        let mut src = self.op.checked_sub(distance).ok_or(LzoError::LookbehindOverrun)?;
        let out_end = self.op.checked_add(count).ok_or(LzoError::OutputOverrun)?;
        if out_end > self.out.len() {
            return Err(LzoError::OutputOverrun);
        }
        for _ in 0..count {
            self.out[self.op] = self.out[src];
            self.op += 1;
            src += 1;
        }
        Ok(())
    }
}

/// Decompress one LZO1X stream into `out`, returning the bytes written.
pub fn lzo1x_decompress(input: &[u8], out: &mut [u8]) -> Result<usize, LzoError> {
    let mut d = Decoder {
        input,
        out,
        ip: 0,
        op: 0,
    };

    // Opening byte above 17 is a bare literal run of length b-17. A run
    // of at least 4 counts as a full literal run for the token that
    // follows; 1..3 behave like a match's trailing literals.
    let first = d.byte()?;
    let mut token;
    let mut after_run;
    if first > 17 {
        let run = first - 17;
        d.copy_literals(run)?;
        token = d.byte()?;
        after_run = run >= 4;
    } else {
        token = d.literal_run(first)?;
        after_run = true;
    }

    loop {
        // decode one match token
        let state;
        if token >= 64 {
            // M2: 3..8 byte match, distance up to 0x800
            let next = d.byte()?;
            let distance = 1 + ((token >> 2) & 7) + (next << 3);
            let count = (token >> 5) + 1;
            d.copy_match(distance, count)?;
            state = token & 3;
        } else if token >= 32 {
            // M3: distance up to 0x4000, length extensible
            let mut count = token & 31;
            if count == 0 {
                count = d.extended_count(31)?;
            }
            let le = d.le16()?;
            let distance = 1 + (le >> 2);
            d.copy_match(distance, count + 2)?;
            state = le & 3;
        } else if token >= 16 {
            // M4: far match, distance 0x4000..0xBFFF; distance zero is
            // the end-of-stream marker
            let far = (token & 8) << 11;
            let mut count = token & 7;
            if count == 0 {
                count = d.extended_count(7)?;
            }
            let le = d.le16()?;
            let distance = far + (le >> 2);
            if distance == 0 {
                if d.ip != d.input.len() {
                    return Err(LzoError::TrailingInput);
                }
                return Ok(d.op);
            }
            d.copy_match(distance + 0x4000, count + 2)?;
            state = le & 3;
        } else if after_run {
            // short match following a literal run: 3 bytes, distance
            // biased past the M2 window
            let next = d.byte()?;
            let distance = 0x801 + (token >> 2) + (next << 2);
            d.copy_match(distance, 3)?;
            state = token & 3;
        } else {
            // 2-byte match directly after another match's literals
            let next = d.byte()?;
            let distance = 1 + (token >> 2) + (next << 2);
            d.copy_match(distance, 2)?;
            state = token & 3;
        }

        if state > 0 {
            // 1..3 trailing literals, then the next token is a match
            d.copy_literals(state)?;
            token = d.byte()?;
            after_run = false;
        } else {
            let next = d.byte()?;
            if next < 16 {
                token = d.literal_run(next)?;
                after_run = true;
            } else {
                token = next;
                after_run = false;
            }
        }
    }
}
