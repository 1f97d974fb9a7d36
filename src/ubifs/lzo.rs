//! LZO1X stream decoder.
//!
//! UBIFS compresses data nodes with LZO1X. The format interleaves literal
//! runs and back-references; the low two bits of most instructions encode
//! how many literal bytes trail the match, and the decoder tracks that as
//! its `state`. This is a safe re-implementation of the reference
//! decompressor: every input fetch, output append and look-behind is
//! bounds-checked.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum LzoError {
    #[error("compressed stream ends mid-instruction")]
    InputOverrun,

    #[error("decompressed data exceeds the declared size")]
    OutputOverrun,

    #[error("match distance {dist} reaches before the output start")]
    LookbehindOverrun { dist: usize },

    #[error("malformed instruction stream")]
    BadStream,
}

/// Decompresses an LZO1X stream into at most `max_out` bytes.
pub(crate) fn decompress(src: &[u8], max_out: usize) -> Result<Vec<u8>, LzoError> {
    let mut out: Vec<u8> = Vec::with_capacity(max_out.min(1 << 16));
    let mut ip = 0usize;

    // How many literals the previous instruction implied: 0 (none), 1-3
    // (short trailing run), 4 (a full literal run just happened).
    let mut state = 0usize;

    let next = |ip: &mut usize| -> Result<u8, LzoError> {
        let b = *src.get(*ip).ok_or(LzoError::InputOverrun)?;
        *ip += 1;
        Ok(b)
    };

    fn copy_literals(
        src: &[u8],
        ip: &mut usize,
        out: &mut Vec<u8>,
        n: usize,
        max_out: usize,
    ) -> Result<(), LzoError> {
        if *ip + n > src.len() {
            return Err(LzoError::InputOverrun);
        }
        if out.len() + n > max_out {
            return Err(LzoError::OutputOverrun);
        }
        out.extend_from_slice(&src[*ip..*ip + n]);
        *ip += n;
        Ok(())
    }

    fn copy_match(
        out: &mut Vec<u8>,
        len: usize,
        dist: usize,
        max_out: usize,
    ) -> Result<(), LzoError> {
        if dist == 0 || dist > out.len() {
            return Err(LzoError::LookbehindOverrun { dist });
        }
        if out.len() + len > max_out {
            return Err(LzoError::OutputOverrun);
        }
        // Overlapping copies are the point: a distance of 1 replicates the
        // previous byte.
        for _ in 0..len {
            let b = out[out.len() - dist];
            out.push(b);
        }
        Ok(())
    }

    // Run-length continuation: zero bytes add 255 each, the first
    // non-zero byte terminates.
    let read_ext = |ip: &mut usize, base: usize| -> Result<usize, LzoError> {
        let mut len = base;
        loop {
            let b = *src.get(*ip).ok_or(LzoError::InputOverrun)?;
            *ip += 1;
            if b == 0 {
                len += 255;
            } else {
                return Ok(len + usize::from(b));
            }
        }
    };

    // A first byte above 17 opens the stream with a bare literal run.
    if src.first().copied().ok_or(LzoError::InputOverrun)? > 17 {
        let n = usize::from(src[0]) - 17;
        ip = 1;
        copy_literals(src, &mut ip, &mut out, n, max_out)?;
        state = if n < 4 { n } else { 4 };
    }

    loop {
        let inst = next(&mut ip)?;

        if inst >= 64 {
            // 2-3 byte match, distance up to 2048.
            let len = usize::from(inst >> 5) + 1;
            let d = next(&mut ip)?;
            let dist = (usize::from(d) << 3) + ((usize::from(inst) >> 2) & 7) + 1;
            copy_match(&mut out, len, dist, max_out)?;
            state = usize::from(inst & 3);
        } else if inst >= 32 {
            // Long match, distance up to 16384.
            let mut len = usize::from(inst & 31);
            if len == 0 {
                len = read_ext(&mut ip, 31)?;
            }
            let lo = next(&mut ip)?;
            let hi = next(&mut ip)?;
            let word = usize::from(lo) | (usize::from(hi) << 8);
            copy_match(&mut out, len + 2, (word >> 2) + 1, max_out)?;
            state = word & 3;
        } else if inst >= 16 {
            // Far match, distance 16384-49151; distance 16384 marks the
            // end of the stream.
            let mut len = usize::from(inst & 7);
            if len == 0 {
                len = read_ext(&mut ip, 7)?;
            }
            let lo = next(&mut ip)?;
            let hi = next(&mut ip)?;
            let word = usize::from(lo) | (usize::from(hi) << 8);
            let dist = 16384 + ((usize::from(inst) & 8) << 11) + (word >> 2);
            state = word & 3;

            if dist == 16384 {
                if len != 1 {
                    return Err(LzoError::BadStream);
                }
                break;
            }
            copy_match(&mut out, len + 2, dist, max_out)?;
        } else {
            match state {
                // No pending context: a literal run.
                0 => {
                    let mut len = usize::from(inst);
                    if len == 0 {
                        len = read_ext(&mut ip, 15)?;
                    }
                    copy_literals(src, &mut ip, &mut out, len + 3, max_out)?;
                    state = 4;
                    continue;
                }
                // Right after a literal run: 3-byte match far back.
                4 => {
                    let d = next(&mut ip)?;
                    let dist = (usize::from(inst) >> 2) + (usize::from(d) << 2) + 2049;
                    copy_match(&mut out, 3, dist, max_out)?;
                    state = usize::from(inst & 3);
                }
                // After short trailing literals: 2-byte match nearby.
                _ => {
                    let d = next(&mut ip)?;
                    let dist = (usize::from(inst) >> 2) + (usize::from(d) << 2) + 1;
                    copy_match(&mut out, 2, dist, max_out)?;
                    state = usize::from(inst & 3);
                }
            }
        }

        if state > 0 && state < 4 {
            copy_literals(src, &mut ip, &mut out, state, max_out)?;
        }
    }

    Ok(out)
}
