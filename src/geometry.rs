//! Geometry Normalizer (C1): turns CAP polygon/circle strings into validated GeoJSON.
//!
//! Pure and synchronous by design (SPEC_FULL.md §4.1) — no I/O, nothing here awaits, so the
//! scheduler can call it inline inside a batch loop without crossing a suspension point.

use serde::{Deserialize, Serialize};
use tracing::warn;

/// WGS-84 mean earth radius in meters, as specified by SPEC_FULL.md (carried from spec.md §4.1).
const EARTH_RADIUS_M: f64 = 6_378_137.0;
const CIRCLE_TESSELLATION_POINTS: usize = 64;

pub type Ring = Vec<[f64; 2]>;

/// A GeoJSON geometry restricted to the two shapes the spatial index accepts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum GeoJson {
    Polygon { coordinates: Vec<Ring> },
    MultiPolygon { coordinates: Vec<Vec<Ring>> },
}

/// Parse a CAP polygon string: whitespace-separated `"lat,lon lat,lon ..."` pairs.
/// Some feeds space-separate lat and lon instead of comma-separating them; both are accepted.
/// Returns points in GeoJSON `[lon, lat]` order, unclosed and unvalidated.
fn parse_polygon_points(raw: &str) -> Vec<[f64; 2]> {
    let tokens: Vec<&str> = raw.split_whitespace().collect();
    let mut pairs: Vec<(f64, f64)> = Vec::new();

    // First try comma-separated "lat,lon" tokens.
    let mut comma_ok = !tokens.is_empty();
    let mut comma_pairs = Vec::with_capacity(tokens.len());
    for tok in &tokens {
        match parse_lat_lon_pair(tok) {
            Some(p) => comma_pairs.push(p),
            None => {
                comma_ok = false;
                break;
            }
        }
    }

    if comma_ok {
        pairs = comma_pairs;
    } else {
        // Fall back to space-separated "lat lon lat lon ...".
        let nums: Vec<Option<f64>> = tokens.iter().map(|t| t.parse::<f64>().ok()).collect();
        if nums.len() % 2 == 0 && nums.iter().all(Option::is_some) {
            for chunk in nums.chunks(2) {
                let lat = chunk[0].unwrap();
                let lon = chunk[1].unwrap();
                pairs.push((lat, lon));
            }
        }
    }

    pairs
        .into_iter()
        .filter(|(lat, lon)| is_valid_coordinate(*lat, *lon))
        .map(|(lat, lon)| [lon, lat])
        .collect()
}

fn parse_lat_lon_pair(token: &str) -> Option<(f64, f64)> {
    let (lat_str, lon_str) = token.split_once(',')?;
    let lat = lat_str.trim().parse::<f64>().ok()?;
    let lon = lon_str.trim().parse::<f64>().ok()?;
    Some((lat, lon))
}

fn is_valid_coordinate(lat: f64, lon: f64) -> bool {
    lat.is_finite() && lon.is_finite() && (-90.0..=90.0).contains(&lat) && (-180.0..=180.0).contains(&lon)
}

/// Parse a CAP circle string: `"lat,lon radiusKm"`.
fn parse_circle(raw: &str) -> Option<(f64, f64, f64)> {
    let mut parts = raw.split_whitespace();
    let center = parts.next()?;
    let radius_str = parts.next()?;
    if parts.next().is_some() {
        return None;
    }
    let (lat, lon) = parse_lat_lon_pair(center)?;
    let radius_km = radius_str.parse::<f64>().ok()?;
    if !is_valid_coordinate(lat, lon) || !radius_km.is_finite() || radius_km <= 0.0 {
        return None;
    }
    Some((lat, lon, radius_km))
}

fn close_ring(mut points: Vec<[f64; 2]>) -> Option<Ring> {
    // Drop consecutive duplicate points (common in sloppy feeds) before counting uniqueness.
    points.dedup();
    if points.len() >= 2 && points.first() == points.last() {
        points.pop();
    }
    if points.len() < 3 {
        return None;
    }
    points.push(points[0]);
    Some(points)
}

/// Orientation of the triple (p, q, r): >0 counter-clockwise, <0 clockwise, 0 collinear.
fn orientation(p: [f64; 2], q: [f64; 2], r: [f64; 2]) -> f64 {
    (q[0] - p[0]) * (r[1] - p[1]) - (q[1] - p[1]) * (r[0] - p[0])
}

fn on_segment(p: [f64; 2], q: [f64; 2], r: [f64; 2]) -> bool {
    q[0] <= p[0].max(r[0]) && q[0] >= p[0].min(r[0]) && q[1] <= p[1].max(r[1]) && q[1] >= p[1].min(r[1])
}

/// Standard orientation-based segment intersection test, including collinear-overlap detection.
fn segments_intersect(p1: [f64; 2], q1: [f64; 2], p2: [f64; 2], q2: [f64; 2]) -> bool {
    let o1 = orientation(p1, q1, p2);
    let o2 = orientation(p1, q1, q2);
    let o3 = orientation(p2, q2, p1);
    let o4 = orientation(p2, q2, q1);

    if o1 * o2 < 0.0 && o3 * o4 < 0.0 {
        return true;
    }
    if o1 == 0.0 && on_segment(p1, p2, q1) {
        return true;
    }
    if o2 == 0.0 && on_segment(p1, q2, q1) {
        return true;
    }
    if o3 == 0.0 && on_segment(p2, p1, q2) {
        return true;
    }
    if o4 == 0.0 && on_segment(p2, q1, q2) {
        return true;
    }
    false
}

/// True if any two non-adjacent edges of a closed ring cross.
fn ring_self_intersects(ring: &Ring) -> bool {
    // ring[last] == ring[0]; edges are (ring[i], ring[i+1]) for i in 0..n-1.
    let n = ring.len() - 1;
    if n < 3 {
        return true;
    }
    for i in 0..n {
        let (a1, a2) = (ring[i], ring[i + 1]);
        for j in (i + 1)..n {
            // Adjacent edges (including the wraparound pair) share a vertex by construction;
            // skip them, they are not "non-adjacent" crossings.
            if j == i || j == i + 1 {
                continue;
            }
            if i == 0 && j == n - 1 {
                continue;
            }
            let (b1, b2) = (ring[j], ring[j + 1]);
            if segments_intersect(a1, a2, b1, b2) {
                return true;
            }
        }
    }
    false
}

fn reversed(ring: &Ring) -> Ring {
    let mut r = ring.clone();
    r.reverse();
    r
}

/// Validate a candidate ring; attempt a winding-order repair if it self-intersects; drop it
/// (returning `None`) if it is still invalid after repair. SPEC_FULL.md §4.1 / spec.md §4.1.
fn validate_or_repair(ring: Ring) -> Option<Ring> {
    if !ring_self_intersects(&ring) {
        return Some(ring);
    }
    let flipped = reversed(&ring);
    if !ring_self_intersects(&flipped) {
        return Some(flipped);
    }
    None
}

fn polygon_ring_from_string(raw: &str) -> Option<Ring> {
    let points = parse_polygon_points(raw);
    let ring = close_ring(points)?;
    validate_or_repair(ring)
}

/// Tessellate a CAP circle into a closed ring using the great-circle formula specified by
/// spec.md §4.1, sampling `CIRCLE_TESSELLATION_POINTS` equally spaced bearings.
fn tessellate_circle(lat_deg: f64, lon_deg: f64, radius_km: f64) -> Option<Ring> {
    let lat = lat_deg.to_radians();
    let lon = lon_deg.to_radians();
    let d = (radius_km * 1000.0) / EARTH_RADIUS_M;

    let mut ring = Vec::with_capacity(CIRCLE_TESSELLATION_POINTS + 1);
    for i in 0..CIRCLE_TESSELLATION_POINTS {
        let theta = 2.0 * std::f64::consts::PI * (i as f64) / (CIRCLE_TESSELLATION_POINTS as f64);
        let lat2 = (lat.sin() * d.cos() + lat.cos() * d.sin() * theta.cos()).asin();
        let lon2 = lon
            + (theta.sin() * d.sin() * lat.cos()).atan2(d.cos() - lat.sin() * lat2.sin());
        let point = [lon2.to_degrees(), lat2.to_degrees()];
        if !is_valid_coordinate(point[1], point[0]) {
            return None;
        }
        ring.push(point);
    }
    ring.push(ring[0]);
    validate_or_repair(ring)
}

/// Normalize the raw polygon/circle strings of one CAP `Area` into a `geoJson` value, or
/// `None` if nothing valid could be produced. Never panics: any malformed input is logged
/// and the offending ring is dropped, per spec.md §4.1's failure policy.
pub fn normalize_area(polygons: &[String], circles: &[String], area_desc: &str) -> Option<GeoJson> {
    let mut rings: Vec<Ring> = Vec::new();

    for raw in polygons {
        match polygon_ring_from_string(raw) {
            Some(ring) => rings.push(ring),
            None => warn!(area = area_desc, raw, "dropping invalid polygon ring"),
        }
    }

    for raw in circles {
        match parse_circle(raw) {
            Some((lat, lon, radius_km)) => match tessellate_circle(lat, lon, radius_km) {
                Some(ring) => rings.push(ring),
                None => warn!(area = area_desc, raw, "dropping invalid circle"),
            },
            None => warn!(area = area_desc, raw, "unparsable circle string"),
        }
    }

    match rings.len() {
        0 => None,
        1 => Some(GeoJson::Polygon {
            coordinates: vec![rings.into_iter().next().unwrap()],
        }),
        _ => Some(GeoJson::MultiPolygon {
            coordinates: rings.into_iter().map(|r| vec![r]).collect(),
        }),
    }
}

/// Point-in-polygon (ray casting) over a single ring, used by C4's `findByPoint`.
pub fn ring_contains_point(ring: &Ring, point: [f64; 2]) -> bool {
    let mut inside = false;
    let n = ring.len() - 1; // last point duplicates the first
    let mut j = n - 1;
    for i in 0..n {
        let (xi, yi) = (ring[i][0], ring[i][1]);
        let (xj, yj) = (ring[j][0], ring[j][1]);
        let intersects = ((yi > point[1]) != (yj > point[1]))
            && (point[0] < (xj - xi) * (point[1] - yi) / (yj - yi) + xi);
        if intersects {
            inside = !inside;
        }
        j = i;
    }
    inside
}

pub fn geojson_contains_point(geo: &GeoJson, point: [f64; 2]) -> bool {
    match geo {
        GeoJson::Polygon { coordinates } => coordinates.iter().any(|r| ring_contains_point(r, point)),
        GeoJson::MultiPolygon { coordinates } => coordinates
            .iter()
            .any(|poly| poly.iter().any(|r| ring_contains_point(r, point))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_comma_separated_polygon() {
        let ring = polygon_ring_from_string("10,20 10,30 20,30 20,20").unwrap();
        // closed, in [lon, lat] order
        assert_eq!(ring.first(), ring.last());
        assert_eq!(ring[0], [20.0, 10.0]);
        assert_eq!(ring.len(), 5);
    }

    #[test]
    fn happy_path_square_matches_spec_example() {
        let geo = normalize_area(
            &["10,20 10,30 20,30 20,20".to_string()],
            &[],
            "test area",
        )
        .unwrap();
        match geo {
            GeoJson::Polygon { coordinates } => {
                assert_eq!(
                    coordinates[0],
                    vec![[20.0, 10.0], [30.0, 10.0], [30.0, 20.0], [20.0, 20.0], [20.0, 10.0]]
                );
            }
            _ => panic!("expected Polygon"),
        }
    }

    #[test]
    fn drops_points_outside_wgs84_bounds() {
        let ring = parse_polygon_points("100,20 10,30 20,30 20,20 10,20");
        assert!(ring.iter().all(|p| p[1] <= 90.0 && p[1] >= -90.0));
    }

    #[test]
    fn closes_unclosed_ring() {
        let ring = close_ring(vec![[0.0, 0.0], [1.0, 0.0], [1.0, 1.0]]).unwrap();
        assert_eq!(ring.first(), ring.last());
    }

    #[test]
    fn rejects_ring_with_fewer_than_three_unique_points() {
        assert!(close_ring(vec![[0.0, 0.0], [1.0, 1.0]]).is_none());
    }

    #[test]
    fn bowtie_polygon_is_dropped_after_failed_repair() {
        // spec.md scenario 4: self-intersecting bowtie that repair cannot fix.
        let geo = normalize_area(&["0,0 0,10 10,0 10,10".to_string()], &[], "bowtie");
        assert!(geo.is_none());
    }

    #[test]
    fn circle_tessellation_contains_center_and_respects_radius_tolerance() {
        let ring = tessellate_circle(41.0, 29.0, 10.0).unwrap();
        let center = [29.0, 41.0];
        assert!(ring_contains_point(&ring, center));

        // Every vertex must be within 0.1% relative tolerance of the requested radius.
        let radius_m = 10_000.0;
        for p in &ring[..ring.len() - 1] {
            let d = haversine_m(41.0, 29.0, p[1], p[0]);
            let rel_err = (d - radius_m).abs() / radius_m;
            assert!(rel_err < 0.001, "relative error too large: {rel_err}");
        }
    }

    #[test]
    fn circle_parses_lat_lon_radius() {
        assert_eq!(parse_circle("41.0,29.0 10"), Some((41.0, 29.0, 10.0)));
        assert_eq!(parse_circle("garbage"), None);
    }

    fn haversine_m(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
        let (lat1, lat2) = (lat1.to_radians(), lat2.to_radians());
        let dlat = (lat2 - lat1).abs();
        let dlon = (lon2 - lon1).to_radians().abs();
        let a = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
        let c = 2.0 * a.sqrt().asin();
        EARTH_RADIUS_M * c
    }

    #[test]
    fn point_in_polygon_matches_ray_casting() {
        let ring = polygon_ring_from_string("0,0 0,10 10,10 10,0").unwrap();
        assert!(ring_contains_point(&ring, [5.0, 5.0]));
        assert!(!ring_contains_point(&ring, [50.0, 50.0]));
    }
}
