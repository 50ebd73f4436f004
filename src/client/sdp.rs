//! Outbound session description rewriting.

use std::collections::HashSet;

pub const OPUS_MAX_AVERAGE_BITRATE: u32 = 160_000;

const RTPMAP_PREFIX: &str = "a=rtpmap:";
const FMTP_PREFIX: &str = "a=fmtp:";

/// Forces stereo and a 160 kbit/s average bitrate on every Opus payload type.
///
/// Existing `stereo` and `maxaveragebitrate` parameters are replaced; payload
/// types without an `a=fmtp` line get one after their `a=rtpmap` line.
pub fn force_stereo_opus(sdp: &str) -> String {
    let newline = if sdp.contains("\r\n") { "\r\n" } else { "\n" };
    let trailing = sdp.ends_with('\n');
    let lines: Vec<&str> = sdp.lines().collect();

    let opus: Vec<&str> = lines.iter().filter_map(|line| opus_payload_type(line)).collect();
    if opus.is_empty() {
        return sdp.to_string();
    }

    let with_fmtp: HashSet<&str> = lines
        .iter()
        .filter_map(|line| fmtp_payload_type(line))
        .filter(|pt| opus.contains(pt))
        .collect();

    let extra = format!("maxaveragebitrate={};stereo=1", OPUS_MAX_AVERAGE_BITRATE);
    let mut out: Vec<String> = Vec::with_capacity(lines.len() + opus.len());

    for line in &lines {
        if let Some(pt) = fmtp_payload_type(line).filter(|pt| opus.contains(pt)) {
            out.push(rewrite_fmtp(line, pt, &extra));
            continue;
        }

        out.push(line.to_string());

        if let Some(pt) = opus_payload_type(line) {
            if !with_fmtp.contains(pt) {
                out.push(format!("{}{} {}", FMTP_PREFIX, pt, extra));
            }
        }
    }

    let mut rewritten = out.join(newline);
    if trailing {
        rewritten.push_str(newline);
    }
    rewritten
}

fn opus_payload_type(line: &str) -> Option<&str> {
    let rest = line.strip_prefix(RTPMAP_PREFIX)?;
    let (pt, codec) = rest.split_once(' ')?;
    codec
        .get(..5)
        .filter(|name| name.eq_ignore_ascii_case("opus/"))
        .map(|_| pt)
}

fn fmtp_payload_type(line: &str) -> Option<&str> {
    let rest = line.strip_prefix(FMTP_PREFIX)?;
    Some(rest.split_once(' ').map_or(rest, |(pt, _)| pt))
}

fn rewrite_fmtp(line: &str, pt: &str, extra: &str) -> String {
    let params = line
        .strip_prefix(FMTP_PREFIX)
        .and_then(|rest| rest.split_once(' '))
        .map_or("", |(_, params)| params);

    let mut kept: Vec<&str> = params
        .split(';')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .filter(|p| {
            let key = p.split('=').next().unwrap_or_default().to_ascii_lowercase();
            key != "maxaveragebitrate" && key != "stereo"
        })
        .collect();
    kept.push(extra);

    format!("{}{} {}", FMTP_PREFIX, pt, kept.join(";"))
}
