//! Human-readable dumps for trace output
//!
//! Every function returns a `String` (one or more newline-separated
//! records) so that callers decide where it goes; the CPU facade feeds them
//! to `tracing` under the `txf::dump` target.

use std::fmt::Write as _;

use txf_concurrency::PageShadowMap;
use txf_core::{ZCACHE_LINE_PAGE, ZCACHE_LINE_SIZE};
use txf_core::{AbortCode, Tdb, WhyAborted};

pub use txf_core::{format_why_aborted, tac_long_description, tac_short_name};

const BYTES_PER_ROW: usize = 16;

/// Hex and printable dump of one cache line
///
/// Each row shows the address, sixteen bytes in four groups and the
/// printable ASCII rendering of those bytes.
pub fn dump_cache_line(prefix: &str, line_address: u64, bytes: &[u8]) -> String {
    let mut out = String::new();
    for (row, chunk) in bytes.chunks(BYTES_PER_ROW).enumerate() {
        let address = line_address.wrapping_add((row * BYTES_PER_ROW) as u64);
        let _ = write!(out, "{}{:016X} ", prefix, address);
        for (n, byte) in chunk.iter().enumerate() {
            if n % 4 == 0 {
                out.push(' ');
            }
            let _ = write!(out, "{:02X}", byte);
        }
        let text: String = chunk
            .iter()
            .map(|&b| if b.is_ascii_graphic() || b == b' ' { b as char } else { '.' })
            .collect();
        let _ = writeln!(out, "  |{}|", text);
    }
    out
}

/// Multi-line rendering of a diagnostic block
///
/// `address` is where the block was stored, if anywhere.
pub fn dump_diagnostic_record(tdb: &Tdb, address: Option<u64>) -> String {
    let mut out = String::new();
    match address {
        Some(address) => {
            let _ = writeln!(out, "TDB @ {:016X}", address);
        }
        None => out.push_str("TDB (not stored)\n"),
    }
    if !tdb.is_valid() {
        let _ = writeln!(out, "  format: {} (invalid)", tdb.format);
        return out;
    }

    let tac = AbortCode::new(tdb.tac);
    let _ = writeln!(
        out,
        "  format: {}  flags: {:02X}{}{}  tnd: {}",
        tdb.format,
        tdb.flags,
        if tdb.conflict_token().is_some() { " CTV" } else { "" },
        if tdb.is_constrained() { " CTI" } else { "" },
        tdb.tnd
    );
    let _ = writeln!(
        out,
        "  tac: {} ({}) {}",
        tac.short_name(),
        tdb.tac,
        tac.long_description()
    );
    if let Some(token) = tdb.conflict_token() {
        let _ = writeln!(out, "  conflict: {:016X}", token);
    }
    let _ = writeln!(out, "  atia: {:016X}  bea: {:016X}", tdb.atia, tdb.bea);
    let _ = writeln!(
        out,
        "  piid: {:08X}  eaid: {:02X}  dxc: {:02X}  teid: {:016X}",
        tdb.piid, tdb.eaid, tdb.dxc, tdb.teid
    );
    for (row, regs) in tdb.gpr.chunks(4).enumerate() {
        let _ = write!(out, "  R{:<2}", row * 4);
        for reg in regs {
            let _ = write!(out, " {:016X}", reg);
        }
        out.push('\n');
    }
    out
}

/// Line-state summary of a page map
///
/// With `include_lines`, every touched line whose private view differs
/// from the clean copy is dumped as well.
pub fn dump_page_map(map: &PageShadowMap, include_lines: bool) -> String {
    let mut out = String::new();
    let states: String = map.line_states().iter().map(|s| s.symbol()).collect();
    let _ = writeln!(
        out,
        "page {:016X} level {} since {} lines {}",
        map.virtual_page_address(),
        map.level(),
        map.since(),
        states
    );
    if include_lines {
        for line in 0..ZCACHE_LINE_PAGE {
            let range = line * ZCACHE_LINE_SIZE..(line + 1) * ZCACHE_LINE_SIZE;
            if map.work_page()[range.clone()] != map.alt_page()[range.clone()] {
                out.push_str(&dump_cache_line(
                    "    ",
                    map.line_address(line),
                    &map.work_page()[range],
                ));
            }
        }
    }
    out
}

/// One-line abort summary used by trace records
pub fn abort_summary(tac: AbortCode, why: WhyAborted) -> String {
    format!("{} {} [{}]", tac.short_name(), tac.long_description(), why)
}
