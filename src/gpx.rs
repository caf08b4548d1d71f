//! GPX track exchange format.
//!
//! Reads and writes the shape produced by field capture devices:
//!
//! ```xml
//! <trkpt lat="-33.45" lon="-70.66">
//!   <ele>540</ele>
//!   <time>2024-03-04T08:00:00Z</time>
//!   <extensions><speed>42.5</speed></extensions>
//! </trkpt>
//! ```
//!
//! Parsing never fails. Points with unusable coordinates are skipped and an
//! unreadable document yields an empty [`Track`], which downstream simply
//! cannot match any control point.

use std::io;

use chrono::{DateTime, NaiveDateTime};
use log::{debug, warn};
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};

use crate::{GeoPoint, Timestamp, Track};

const CREATOR: &str = "tramify";

/// Parse GPX text into a track. Never fails; see module docs.
pub fn parse_gpx(xml: &str) -> Track {
    match read_track(xml) {
        Ok(track) => {
            debug!(
                "[GpxParser] Parsed '{}' with {} points",
                track.name(),
                track.len()
            );
            track
        }
        Err(e) => {
            warn!("[GpxParser] Unreadable track payload, using empty track: {}", e);
            Track::empty()
        }
    }
}

/// Parse an RFC 3339 timestamp, falling back to a zoneless ISO form read as UTC.
pub fn parse_timestamp(text: &str) -> Option<Timestamp> {
    let text = text.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(text) {
        return Some(ts);
    }
    NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc().fixed_offset())
}

/// Child element whose text is currently being read.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Field {
    Elevation,
    Time,
    Speed,
    /// `metadata/name`
    DocumentName,
    /// `trk/name`
    TrackName,
}

/// Point under construction between `<trkpt>` and `</trkpt>`.
#[derive(Debug, Default)]
struct PendingPoint {
    coords: Option<(f64, f64)>,
    elevation: Option<f64>,
    time: Option<Timestamp>,
    speed: Option<f64>,
}

impl PendingPoint {
    fn from_start(e: &BytesStart) -> Self {
        let mut lat = None;
        let mut lon = None;
        for attr in e.attributes().flatten() {
            let value = match attr.unescape_value() {
                Ok(v) => v,
                Err(_) => continue,
            };
            match attr.key.local_name().as_ref() {
                b"lat" => lat = value.trim().parse::<f64>().ok(),
                b"lon" => lon = value.trim().parse::<f64>().ok(),
                _ => {}
            }
        }
        let coords = match (lat, lon) {
            (Some(lat), Some(lon)) if lat.is_finite() && lon.is_finite() => Some((lat, lon)),
            _ => None,
        };
        Self {
            coords,
            ..Default::default()
        }
    }

    fn finish(self) -> Option<GeoPoint> {
        let (latitude, longitude) = self.coords?;
        Some(GeoPoint {
            latitude,
            longitude,
            elevation: self.elevation,
            time: self.time,
            speed: self.speed,
        })
    }
}

fn read_track(xml: &str) -> Result<Track, quick_xml::Error> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut points = Vec::new();
    let mut skipped = 0usize;
    let mut metadata_name: Option<String> = None;
    let mut metadata_time: Option<Timestamp> = None;
    let mut track_name: Option<String> = None;

    // Local names of the open elements, outermost first
    let mut open: Vec<Vec<u8>> = Vec::new();
    let mut pending: Option<PendingPoint> = None;
    let mut field: Option<Field> = None;

    loop {
        match reader.read_event()? {
            Event::Start(e) => {
                let tag = e.local_name().as_ref().to_vec();
                let parent = open.last().map(Vec::as_slice);
                match tag.as_slice() {
                    b"trkpt" => pending = Some(PendingPoint::from_start(&e)),
                    b"ele" if pending.is_some() => field = Some(Field::Elevation),
                    b"speed" if pending.is_some() => field = Some(Field::Speed),
                    b"time" if pending.is_some() || matches!(parent, Some(b"metadata")) => {
                        field = Some(Field::Time)
                    }
                    b"name" if matches!(parent, Some(b"metadata")) => {
                        field = Some(Field::DocumentName)
                    }
                    b"name" if matches!(parent, Some(b"trk")) => field = Some(Field::TrackName),
                    _ => {}
                }
                open.push(tag);
            }
            Event::Empty(e) => {
                if e.local_name().as_ref() == b"trkpt" {
                    match PendingPoint::from_start(&e).finish() {
                        Some(p) => points.push(p),
                        None => skipped += 1,
                    }
                }
            }
            Event::Text(t) => {
                if let Some(f) = field {
                    let text = t.unescape()?;
                    let text = text.trim();
                    match (f, pending.as_mut()) {
                        (Field::Elevation, Some(p)) => p.elevation = text.parse().ok(),
                        (Field::Speed, Some(p)) => p.speed = text.parse().ok(),
                        (Field::Time, Some(p)) => p.time = parse_timestamp(text),
                        (Field::Time, None) => metadata_time = parse_timestamp(text),
                        (Field::DocumentName, _) => {
                            metadata_name.get_or_insert_with(|| text.to_string());
                        }
                        (Field::TrackName, _) => {
                            track_name.get_or_insert_with(|| text.to_string());
                        }
                        _ => {}
                    }
                }
            }
            Event::End(e) => {
                open.pop();
                match e.local_name().as_ref() {
                    b"trkpt" => {
                        if let Some(p) = pending.take() {
                            match p.finish() {
                                Some(point) => points.push(point),
                                None => skipped += 1,
                            }
                        }
                    }
                    b"ele" | b"speed" | b"time" | b"name" => field = None,
                    _ => {}
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if skipped > 0 {
        debug!("[GpxParser] Skipped {} points with unusable coordinates", skipped);
    }

    let name = metadata_name.or(track_name).unwrap_or_default();
    let started_at = metadata_time.or_else(|| points.iter().find_map(|p: &GeoPoint| p.time));

    Ok(Track::new(name, started_at, points))
}

/// Serialize a track to GPX 1.1.
///
/// Missing elevation and speed are written as 0, missing times are omitted.
pub fn write_gpx(track: &Track) -> String {
    match write_document(track) {
        Ok(xml) => xml,
        Err(e) => {
            warn!("[GpxWriter] Could not serialize '{}': {}", track.name(), e);
            String::new()
        }
    }
}

fn write_document(track: &Track) -> io::Result<String> {
    let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);

    writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;
    writer.write_event(Event::Start(
        BytesStart::new("gpx").with_attributes([("version", "1.1"), ("creator", CREATOR)]),
    ))?;

    writer.write_event(Event::Start(BytesStart::new("metadata")))?;
    write_text_element(&mut writer, "name", track.name())?;
    if let Some(started_at) = track.started_at() {
        write_text_element(&mut writer, "time", &started_at.to_rfc3339())?;
    }
    writer.write_event(Event::End(BytesEnd::new("metadata")))?;

    writer.write_event(Event::Start(BytesStart::new("trk")))?;
    write_text_element(&mut writer, "name", track.name())?;
    writer.write_event(Event::Start(BytesStart::new("trkseg")))?;

    for p in track.points() {
        let lat = p.latitude.to_string();
        let lon = p.longitude.to_string();
        writer.write_event(Event::Start(
            BytesStart::new("trkpt").with_attributes([("lat", lat.as_str()), ("lon", lon.as_str())]),
        ))?;
        write_text_element(&mut writer, "ele", &p.elevation.unwrap_or(0.0).to_string())?;
        if let Some(time) = p.time {
            write_text_element(&mut writer, "time", &time.to_rfc3339())?;
        }
        writer.write_event(Event::Start(BytesStart::new("extensions")))?;
        write_text_element(&mut writer, "speed", &p.speed.unwrap_or(0.0).to_string())?;
        writer.write_event(Event::End(BytesEnd::new("extensions")))?;
        writer.write_event(Event::End(BytesEnd::new("trkpt")))?;
    }

    writer.write_event(Event::End(BytesEnd::new("trkseg")))?;
    writer.write_event(Event::End(BytesEnd::new("trk")))?;
    writer.write_event(Event::End(BytesEnd::new("gpx")))?;

    String::from_utf8(writer.into_inner()).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

/// `<tag>text</tag>`, with the text escaped.
fn write_text_element<W: io::Write>(writer: &mut Writer<W>, tag: &str, text: &str) -> io::Result<()> {
    writer.write_event(Event::Start(BytesStart::new(tag)))?;
    writer.write_event(Event::Text(BytesText::new(text)))?;
    writer.write_event(Event::End(BytesEnd::new(tag)))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<gpx version="1.1" creator="field-device" xmlns:gpxtpx="http://www.garmin.com/xmlschemas/TrackPointExtension/v1">
  <metadata>
    <name>20240304080000-Alameda-Público</name>
    <time>2024-03-04T08:00:00-03:00</time>
  </metadata>
  <trk>
    <name>Alameda</name>
    <trkseg>
      <trkpt lat="-33.4500" lon="-70.6600">
        <ele>540.5</ele>
        <time>2024-03-04T08:00:05-03:00</time>
        <extensions><speed>32.5</speed></extensions>
      </trkpt>
      <trkpt lat="north" lon="-70.6600">
        <time>2024-03-04T08:00:10-03:00</time>
      </trkpt>
      <trkpt lat="-33.4510" lon="-70.6600">
        <extensions><gpxtpx:speed>35</gpxtpx:speed></extensions>
      </trkpt>
      <trkpt lat="-33.4520" lon="-70.6600"/>
    </trkseg>
  </trk>
</gpx>"#;

    #[test]
    fn test_parse_sample() {
        let track = parse_gpx(SAMPLE);
        assert_eq!(track.name(), "20240304080000-Alameda-Público");
        assert_eq!(
            track.started_at(),
            Some(DateTime::parse_from_rfc3339("2024-03-04T08:00:00-03:00").unwrap())
        );

        // Non-numeric latitude is skipped
        assert_eq!(track.len(), 3);

        let first = track.points()[0];
        assert_eq!(first.latitude, -33.45);
        assert_eq!(first.elevation, Some(540.5));
        assert_eq!(first.speed, Some(32.5));
        assert!(first.time.is_some());

        let second = track.points()[1];
        assert_eq!(second.speed, Some(35.0));
        assert_eq!(second.time, None);
        assert_eq!(second.elevation, None);

        assert_eq!(track.points()[2].latitude, -33.452);
    }

    #[test]
    fn test_malformed_yields_empty_track() {
        let track = parse_gpx("<gpx><trk><trkseg><trkpt lat=\"1\" lon=\"2\"></trk></gpx>");
        assert!(track.is_empty());

        assert!(parse_gpx("").is_empty());
        assert!(parse_gpx("not xml at all").is_empty());
    }

    #[test]
    fn test_track_name_falls_back_to_trk() {
        let xml = r#"<gpx><trk><name>Costanera</name><trkseg>
            <trkpt lat="1" lon="2"><time>2024-01-01T10:00:00Z</time></trkpt>
        </trkseg></trk></gpx>"#;
        let track = parse_gpx(xml);
        assert_eq!(track.name(), "Costanera");
        // Capture start falls back to the first fix
        assert_eq!(track.started_at(), track.points()[0].time);
    }

    #[test]
    fn test_parse_timestamp_variants() {
        let with_offset = parse_timestamp("2024-03-04T08:00:00-03:00").unwrap();
        assert_eq!(with_offset.offset().local_minus_utc(), -3 * 3600);

        let zulu = parse_timestamp("2024-03-04T11:00:00.250Z").unwrap();
        assert_eq!(zulu.offset().local_minus_utc(), 0);

        let naive = parse_timestamp("2024-03-04T11:00:00").unwrap();
        assert_eq!(naive.offset().local_minus_utc(), 0);

        assert!(parse_timestamp("yesterday").is_none());
    }

    #[test]
    fn test_write_escapes_name() {
        let track = Track::new("A & B <north>", None, vec![GeoPoint::new(1.0, 2.0)]);
        let xml = write_gpx(&track);
        assert!(xml.contains("A &amp; B &lt;north&gt;"));
        assert_eq!(parse_gpx(&xml).name(), "A & B <north>");
    }

    #[test]
    fn test_author_name_is_not_track_name() {
        let xml = r#"<gpx>
            <metadata><author><name>Juan</name></author></metadata>
            <trk><name>Alameda</name><trkseg><trkpt lat="1" lon="2"/></trkseg></trk>
        </gpx>"#;
        assert_eq!(parse_gpx(xml).name(), "Alameda");

        // Names of routes and waypoints are not the track name either
        let xml = r#"<gpx><wpt lat="0" lon="0"><name>Hito</name></wpt>
            <trk><name>Costanera</name></trk></gpx>"#;
        assert_eq!(parse_gpx(xml).name(), "Costanera");
    }

    #[test]
    fn test_write_then_parse_preserves_points() {
        let t0 = DateTime::parse_from_rfc3339("2024-03-04T08:00:00-03:00").unwrap();
        let points: Vec<GeoPoint> = (0..5)
            .map(|i| {
                GeoPoint::new(-33.45 - i as f64 * 0.000_123_4, -70.660_001 + i as f64 * 1e-7)
                    .with_elevation(540.25 + i as f64)
                    .with_time(t0 + chrono::Duration::milliseconds(15_250 * i as i64))
                    .with_speed(42.5)
            })
            .collect();
        let track = Track::new("Alameda", Some(t0), points);

        let reparsed = parse_gpx(&write_gpx(&track));
        assert_eq!(reparsed.len(), track.len());
        for (a, b) in track.points().iter().zip(reparsed.points()) {
            assert!((a.latitude - b.latitude).abs() < 1e-9);
            assert!((a.longitude - b.longitude).abs() < 1e-9);
            assert!((a.elevation.unwrap() - b.elevation.unwrap()).abs() < 1e-9);
            assert!((a.speed.unwrap() - b.speed.unwrap()).abs() < 1e-9);
            assert_eq!(a.time, b.time);
        }
    }
}
