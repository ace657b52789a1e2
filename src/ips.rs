//! IPS export of the difference between two ROM images

use crate::error::PatchError;
use log::debug;

const IPS_HEADER: &[u8] = b"PATCH";
const IPS_FOOTER: &[u8] = b"EOF";
/// An offset spelling "EOF" would be read as the footer
const EOF_OFFSET: usize = 0x454F46;
const MAX_RECORD: usize = 0xFFFF;
const MAX_OFFSET: usize = 0xFF_FFFF;
/// Unchanged bytes cheaper to repeat than to open a new 5 byte record for
const MERGE_GAP: usize = 5;

/// Differing runs of `original` vs `patched` as `(offset, len)`
fn changed_runs(original: &[u8], patched: &[u8]) -> Vec<(usize, usize)> {
    let mut runs: Vec<(usize, usize)> = Vec::new();
    let mut i = 0;
    while i < patched.len() {
        if original[i] == patched[i] {
            i += 1;
            continue;
        }
        let start = i;
        while i < patched.len() && original[i] != patched[i] {
            i += 1;
        }
        match runs.last_mut() {
            Some((prev_start, prev_len)) if start - (*prev_start + *prev_len) <= MERGE_GAP => {
                *prev_len = i - *prev_start;
            }
            _ => runs.push((start, i - start)),
        }
    }
    runs
}

/// Build an IPS patch that turns `original` into `patched`
pub fn build_ips(original: &[u8], patched: &[u8]) -> Result<Vec<u8>, PatchError> {
    if original.len() != patched.len() {
        return Err(PatchError::InvalidParameter(format!(
            "IPS needs images of equal size, got {} and {} bytes",
            original.len(),
            patched.len()
        )));
    }

    let mut out = IPS_HEADER.to_vec();
    let mut records = 0;
    for (run_start, run_len) in changed_runs(original, patched) {
        let run_end = run_start + run_len;
        let mut start = run_start;
        while start < run_end {
            if start == EOF_OFFSET {
                // start one byte early, rewriting it with its patched value
                start -= 1;
            }
            let end = (start + MAX_RECORD).min(run_end);
            if start > MAX_OFFSET {
                return Err(PatchError::AddressOutOfRange(format!(
                    "offset {:#x} does not fit an IPS record",
                    start
                )));
            }
            let [_, o2, o1, o0] = (start as u32).to_be_bytes();
            let [s1, s0] = ((end - start) as u16).to_be_bytes();
            out.extend_from_slice(&[o2, o1, o0, s1, s0]);
            out.extend_from_slice(&patched[start..end]);
            records += 1;
            start = end;
        }
    }
    out.extend_from_slice(IPS_FOOTER);

    debug!("IPS patch: {} records, {} bytes", records, out.len());
    Ok(out)
}
