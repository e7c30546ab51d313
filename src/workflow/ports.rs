//! Parser for the port-forward port specification grammar:
//! `PortList := Item (',' Item)*` where an item is a single port, a `local:remote` pair, a
//! range, or a `range:range` pair with ranges expanded inclusively.

use regex::Regex;

use crate::{OsmoError, Result};

/// Parses a port specification into parallel local and remote port lists of equal length.
pub fn parse_port_spec(input: &str) -> Result<(Vec<u16>, Vec<u16>)> {
    let range_item = Regex::new(r"^\d+-\d+(:\d+-\d+)?$").expect("static regex compiles");

    let mut local_ports = Vec::new();
    let mut remote_ports = Vec::new();
    for interval in input.split(',') {
        if range_item.is_match(interval) {
            let mut sides = interval.split(':');
            let local = parse_range(sides.next().expect("split yields at least one item"))?;
            let remote = match sides.next() {
                Some(remote) => parse_range(remote)?,
                None => local.clone(),
            };
            local_ports.extend(local);
            remote_ports.extend(remote);
        } else {
            let (local, remote) = parse_single(interval)?;
            local_ports.push(local);
            remote_ports.push(remote);
        }
    }

    if local_ports.len() != remote_ports.len() {
        return Err(OsmoError::user(format!(
            "Invalid number of ports provided. Local ports are {} and remote ports are {}",
            local_ports.len(),
            remote_ports.len()
        )));
    }
    Ok((local_ports, remote_ports))
}

/// Expands `N1-N2` inclusively, requiring `0 <= N1 < N2 <= 65535`.
fn parse_range(range: &str) -> Result<Vec<u16>> {
    let invalid = || {
        OsmoError::user(format!(
            "Invalid port value: {}. Port value must be between 0 and 65535.",
            range
        ))
    };
    let (start, end) = range.split_once('-').ok_or_else(invalid)?;
    let start: u32 = start.parse().map_err(|_| invalid())?;
    let end: u32 = end.parse().map_err(|_| invalid())?;
    if end > 65535 || start >= end {
        return Err(invalid());
    }
    Ok((start as u16..=end as u16).collect())
}

/// Parses `port` or `local:remote`. A single value is used for both sides.
fn parse_single(item: &str) -> Result<(u16, u16)> {
    let format_err = || {
        OsmoError::user(format!(
            "Invalid port format: {}. Please use format <integer>:<integer> or <integer>.",
            item
        ))
    };
    let single = Regex::new(r"^\d+(:\d+)?$").expect("static regex compiles");
    if !single.is_match(item) {
        return Err(format_err());
    }

    let mut ports = Vec::new();
    for part in item.split(':') {
        let port: u32 = part.parse().map_err(|_| format_err())?;
        if port > 65535 {
            return Err(OsmoError::user(format!(
                "Invalid port value: {}. Port value must be between 0 and 65535.",
                port
            )));
        }
        ports.push(port as u16);
    }
    match ports[..] {
        [port] => Ok((port, port)),
        [local, remote] => Ok((local, remote)),
        _ => Err(format_err()),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("8000", vec![8000], vec![8000])]
    #[case("8000:2000", vec![8000], vec![2000])]
    #[case("8000-8002", vec![8000, 8001, 8002], vec![8000, 8001, 8002])]
    #[case("8000-8002:9000-9002", vec![8000, 8001, 8002], vec![9000, 9001, 9002])]
    #[case(
        "8000-8002:9000-9002,8005",
        vec![8000, 8001, 8002, 8005],
        vec![9000, 9001, 9002, 8005]
    )]
    fn test_valid_specs(
        #[case] input: &str,
        #[case] local: Vec<u16>,
        #[case] remote: Vec<u16>,
    ) {
        let (parsed_local, parsed_remote) = parse_port_spec(input).unwrap();
        assert_eq!(parsed_local, local);
        assert_eq!(parsed_remote, remote);
        assert_eq!(parsed_local.len(), parsed_remote.len());
    }

    #[rstest]
    #[case("eight thousand")]
    #[case("8000:")]
    #[case(":8000")]
    #[case("8000:9000:10000")]
    #[case("-8000")]
    #[case("70000")]
    #[case("8000:70000")]
    #[case("9000-8000")]
    #[case("8000-8000")]
    #[case("8000-70000")]
    #[case("8000-8005:9000-9002")]
    fn test_invalid_specs(#[case] input: &str) {
        assert!(parse_port_spec(input).is_err(), "{} should be rejected", input);
    }
}
