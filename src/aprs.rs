/*! Basic APRS payload decoding.

Enough to classify the data type, pull out a position when one is
present (uncompressed or base-91 compressed), and produce the one-line
human description the monitor prints. Strictly for logging, the heard
list and waypoint output: nothing here influences routing, and a
payload that fails to decode is simply shown raw.
 */

/// What we could make of an APRS info field.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AprsInfo {
    /// Short human label like "Position" or "Message".
    pub description: String,
    /// Decoded latitude, degrees north.
    pub lat: Option<f64>,
    /// Decoded longitude, degrees east.
    pub lon: Option<f64>,
    /// Symbol table selector.
    pub symbol_table: char,
    /// Symbol code within the table.
    pub symbol_code: char,
    /// Object name, for object reports.
    pub name: Option<String>,
    /// Addressee, for messages.
    pub addressee: Option<String>,
    /// Trailing free text.
    pub comment: String,
}

fn parse_uncompressed(s: &[u8]) -> Option<(f64, f64, char, char, usize)> {
    // ddmm.mmN/dddmm.mmW- : 8 + 1 + 9 + 1 bytes.
    if s.len() < 19 {
        return None;
    }
    let lat_deg: f64 = std::str::from_utf8(&s[0..2]).ok()?.parse().ok()?;
    let lat_min: f64 = std::str::from_utf8(&s[2..7]).ok()?.parse().ok()?;
    let ns = s[7];
    let table = s[8] as char;
    let lon_deg: f64 = std::str::from_utf8(&s[9..12]).ok()?.parse().ok()?;
    let lon_min: f64 = std::str::from_utf8(&s[12..17]).ok()?.parse().ok()?;
    let ew = s[17];
    let code = s[18] as char;
    let mut lat = lat_deg + lat_min / 60.0;
    let mut lon = lon_deg + lon_min / 60.0;
    match ns {
        b'N' => {}
        b'S' => lat = -lat,
        _ => return None,
    }
    match ew {
        b'E' => {}
        b'W' => lon = -lon,
        _ => return None,
    }
    if lat_deg > 90.0 || lon_deg > 180.0 {
        return None;
    }
    Some((lat, lon, table, code, 19))
}

fn base91(s: &[u8]) -> Option<f64> {
    let mut v = 0f64;
    for &c in s {
        if !(33..=124).contains(&c) {
            return None;
        }
        v = v * 91.0 + (c - 33) as f64;
    }
    Some(v)
}

fn parse_compressed(s: &[u8]) -> Option<(f64, f64, char, char, usize)> {
    // /YYYYXXXX$cs T : table, 4 lat, 4 lon, code, 3 more.
    if s.len() < 13 {
        return None;
    }
    let table = s[0] as char;
    if !matches!(table, '/' | '\\' | 'A'..='Z' | 'a'..='j') {
        return None;
    }
    let lat = 90.0 - base91(&s[1..5])? / 380926.0;
    let lon = -180.0 + base91(&s[5..9])? / 190463.0;
    let code = s[9] as char;
    Some((lat, lon, table, code, 13))
}

fn parse_position(s: &[u8]) -> Option<(f64, f64, char, char, usize)> {
    parse_uncompressed(s).or_else(|| parse_compressed(s))
}

/// Decode an APRS info field. `None` when the data type indicator is
/// unknown to us; the caller shows the raw text in that case.
#[must_use]
pub fn decode(info: &[u8]) -> Option<AprsInfo> {
    let (&dti, rest) = info.split_first()?;
    let mut out = AprsInfo::default();
    match dti {
        b'!' | b'=' => {
            out.description = "Position".to_string();
            if let Some((lat, lon, table, code, used)) = parse_position(rest) {
                out.lat = Some(lat);
                out.lon = Some(lon);
                out.symbol_table = table;
                out.symbol_code = code;
                out.comment = String::from_utf8_lossy(&rest[used..]).into_owned();
            }
        }
        b'/' | b'@' => {
            out.description = "Position with timestamp".to_string();
            if rest.len() > 7 {
                if let Some((lat, lon, table, code, used)) = parse_position(&rest[7..]) {
                    out.lat = Some(lat);
                    out.lon = Some(lon);
                    out.symbol_table = table;
                    out.symbol_code = code;
                    out.comment = String::from_utf8_lossy(&rest[7 + used..]).into_owned();
                }
            }
        }
        b';' => {
            out.description = "Object".to_string();
            if rest.len() > 18 {
                out.name = Some(
                    String::from_utf8_lossy(&rest[..9])
                        .trim_end()
                        .to_string(),
                );
                // name, live/killed flag, timestamp, then position.
                if let Some((lat, lon, table, code, used)) = parse_position(&rest[17..]) {
                    out.lat = Some(lat);
                    out.lon = Some(lon);
                    out.symbol_table = table;
                    out.symbol_code = code;
                    out.comment = String::from_utf8_lossy(&rest[17 + used..]).into_owned();
                }
            }
        }
        b')' => {
            out.description = "Item".to_string();
        }
        b':' => {
            out.description = "Message".to_string();
            if rest.len() >= 10 && rest[9] == b':' {
                out.addressee = Some(
                    String::from_utf8_lossy(&rest[..9])
                        .trim_end()
                        .to_string(),
                );
                out.comment = String::from_utf8_lossy(&rest[10..]).into_owned();
            }
        }
        b'>' => {
            out.description = "Status".to_string();
            out.comment = String::from_utf8_lossy(rest).into_owned();
        }
        b'T' => {
            out.description = "Telemetry".to_string();
        }
        b'`' | b'\'' => {
            out.description = "MIC-E".to_string();
        }
        b'<' => {
            out.description = "Station capabilities".to_string();
        }
        b'?' => {
            out.description = "Query".to_string();
        }
        b'{' => {
            out.description = "User defined".to_string();
        }
        b'$' => {
            out.description = "Raw GPS".to_string();
        }
        _ => return None,
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uncompressed_position() {
        let a = decode(b"!4903.50N/07201.75W-Test 001234").unwrap();
        assert_eq!(a.description, "Position");
        assert!((a.lat.unwrap() - 49.0583).abs() < 0.001);
        assert!((a.lon.unwrap() + 72.0292).abs() < 0.001);
        assert_eq!(a.symbol_table, '/');
        assert_eq!(a.symbol_code, '-');
        assert_eq!(a.comment, "Test 001234");
    }

    #[test]
    fn southern_western_signs() {
        let a = decode(b"=3316.00S/07000.00W>").unwrap();
        assert!(a.lat.unwrap() < 0.0);
        assert!(a.lon.unwrap() < 0.0);
    }

    #[test]
    fn compressed_position() {
        // The worked example from the APRS spec.
        let a = decode(b"!/5L!!<*e7>7P[comment").unwrap();
        assert!((a.lat.unwrap() - 49.5).abs() < 0.01);
        assert!((a.lon.unwrap() + 72.75).abs() < 0.01);
        assert_eq!(a.comment, "comment");
    }

    #[test]
    fn status_and_message() {
        let s = decode(b">out to lunch").unwrap();
        assert_eq!(s.description, "Status");
        assert_eq!(s.comment, "out to lunch");

        let m = decode(b":N0CALL   :hello there{003").unwrap();
        assert_eq!(m.description, "Message");
        assert_eq!(m.addressee.as_deref(), Some("N0CALL"));
        assert_eq!(m.comment, "hello there{003");
    }

    #[test]
    fn object_name() {
        let a = decode(b";LEADER   *092345z4903.50N/07201.75W>").unwrap();
        assert_eq!(a.name.as_deref(), Some("LEADER"));
        assert!(a.lat.is_some());
    }

    #[test]
    fn unknown_type() {
        assert!(decode(b"qnonsense").is_none());
        assert!(decode(b"").is_none());
    }

    #[test]
    fn garbage_position_is_not_a_position() {
        let a = decode(b"!not a position at all").unwrap();
        assert_eq!(a.description, "Position");
        assert!(a.lat.is_none());
    }
}
