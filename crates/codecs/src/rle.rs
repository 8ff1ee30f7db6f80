//! Byte-oriented run-length coding (PackBits layout).
//!
//! A control byte `c < 128` is followed by `c + 1` literal bytes. A control
//! byte `c >= 128` is followed by one byte repeated `c - 125` times, so runs
//! span 3 to 130 bytes. Runs of two are cheaper as literals.

use vcs_common::{CodingError, CodingResult};

const MIN_RUN: usize = 3;
const MAX_RUN: usize = 130;
const MAX_LITERAL: usize = 128;

/// Append the run-length coding of `input` to `out`.
pub fn encode(input: &[u8], out: &mut Vec<u8>) {
    let mut i = 0;
    let mut literal_start = 0;

    while i < input.len() {
        let run = run_length(&input[i..]);
        if run >= MIN_RUN {
            flush_literals(&input[literal_start..i], out);
            out.push((run + 125) as u8);
            out.push(input[i]);
            i += run;
            literal_start = i;
        } else {
            i += 1;
            if i - literal_start == MAX_LITERAL {
                flush_literals(&input[literal_start..i], out);
                literal_start = i;
            }
        }
    }
    flush_literals(&input[literal_start..], out);
}

/// Decode `input`, which must expand to exactly `expected_len` bytes.
pub fn decode(input: &[u8], expected_len: usize) -> CodingResult<Vec<u8>> {
    let mut out = Vec::with_capacity(expected_len);
    let mut i = 0;

    while i < input.len() {
        let control = input[i] as usize;
        i += 1;
        if control < 128 {
            let count = control + 1;
            let literal = input
                .get(i..i + count)
                .ok_or_else(|| malformed("literal run past end of data"))?;
            out.extend_from_slice(literal);
            i += count;
        } else {
            let value = *input.get(i).ok_or_else(|| malformed("missing run value"))?;
            out.resize(out.len() + control - 125, value);
            i += 1;
        }
        if out.len() > expected_len {
            return Err(malformed("data expands past the frame size"));
        }
    }

    if out.len() != expected_len {
        return Err(malformed("data ends before the frame is complete"));
    }
    Ok(out)
}

fn run_length(data: &[u8]) -> usize {
    let first = data[0];
    data.iter()
        .take(MAX_RUN)
        .take_while(|&&b| b == first)
        .count()
}

fn flush_literals(literals: &[u8], out: &mut Vec<u8>) {
    for chunk in literals.chunks(MAX_LITERAL) {
        out.push((chunk.len() - 1) as u8);
        out.extend_from_slice(chunk);
    }
}

fn malformed(what: &str) -> CodingError {
    CodingError::CodecMalfunction(format!("malformed run-length data: {what}"))
}
