//! Great-circle geometry: distances, bearings, dead-reckoning, circular
//! geofences and route interpolation.

use serde::{Deserialize, Serialize};

use crate::event::Location;

pub const EARTH_RADIUS_METERS: f64 = 6_371_000.0;

/// Circular geofence. The device is "inside" when the haversine distance
/// from its position to the center is within the radius.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Geofence {
    pub id: String,
    pub lat: f64,
    pub lon: f64,
    pub radius_meters: f64,
}

/// Waypoint on a scripted route.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct RoutePoint {
    pub lat: f64,
    pub lon: f64,
}

/// Haversine distance between two WGS84 coordinates, in meters.
pub fn distance_meters(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let d_lat = (lat2 - lat1).to_radians();
    let d_lon = (lon2 - lon1).to_radians();

    let a = (d_lat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (d_lon / 2.0).sin().powi(2);

    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());
    EARTH_RADIUS_METERS * c
}

/// Initial bearing from one coordinate to another, degrees in `[0, 360)`.
pub fn bearing_degrees(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let d_lon = (lon2 - lon1).to_radians();
    let y = d_lon.sin() * lat2.to_radians().cos();
    let x = lat1.to_radians().cos() * lat2.to_radians().sin()
        - lat1.to_radians().sin() * lat2.to_radians().cos() * d_lon.cos();

    (y.atan2(x).to_degrees() + 360.0) % 360.0
}

/// Moves a location along a bearing for the given distance. Altitude and
/// accuracy are carried over unchanged.
pub fn move_location(from: Location, bearing_deg: f64, distance_meters: f64) -> Location {
    let bearing = bearing_deg.to_radians();
    let d = distance_meters / EARTH_RADIUS_METERS;

    let lat1 = from.lat.to_radians();
    let lon1 = from.lon.to_radians();

    let lat2 = (lat1.sin() * d.cos() + lat1.cos() * d.sin() * bearing.cos()).asin();
    let lon2 = lon1
        + (bearing.sin() * d.sin() * lat1.cos()).atan2(d.cos() - lat1.sin() * lat2.sin());

    Location {
        lat: lat2.to_degrees(),
        lon: lon2.to_degrees(),
        ..from
    }
}

pub fn is_inside(location: &Location, fence: &Geofence) -> bool {
    distance_meters(location.lat, location.lon, fence.lat, fence.lon) <= fence.radius_meters
}

/// Ids of all geofences containing the location.
pub fn inside_set<'a>(location: &Location, fences: &'a [Geofence]) -> Vec<&'a str> {
    fences
        .iter()
        .filter(|fence| is_inside(location, fence))
        .map(|fence| fence.id.as_str())
        .collect()
}

/// Linear interpolation along a route by normalized progress in `[0, 1]`.
/// Returns `None` for an empty route.
pub fn interpolate_route(route: &[RoutePoint], progress: f64) -> Option<Location> {
    let first = route.first()?;
    if route.len() == 1 {
        return Some(Location {
            lat: first.lat,
            lon: first.lon,
            ..Default::default()
        });
    }

    let progress = progress.clamp(0.0, 1.0);
    let scaled = progress * (route.len() - 1) as f64;
    let index = (scaled as usize).min(route.len() - 2);
    let local = scaled - index as f64;

    let p1 = route[index];
    let p2 = route[index + 1];

    Some(Location {
        lat: p1.lat + (p2.lat - p1.lat) * local,
        lon: p1.lon + (p2.lon - p1.lon) * local,
        ..Default::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loc(lat: f64, lon: f64) -> Location {
        Location {
            lat,
            lon,
            ..Default::default()
        }
    }

    #[test]
    fn haversine_distance_is_plausible() {
        // Johannesburg CBD to Sandton, roughly 11 km
        let d = distance_meters(-26.2041, 28.0473, -26.1076, 28.0567);
        assert!((10_000.0..12_000.0).contains(&d), "got {d}");

        assert_eq!(distance_meters(10.0, 20.0, 10.0, 20.0), 0.0);
    }

    #[test]
    fn move_location_roundtrips_through_distance() {
        let start = loc(-26.2041, 28.0473);
        let moved = move_location(start, 90.0, 500.0);
        let d = distance_meters(start.lat, start.lon, moved.lat, moved.lon);
        assert!((d - 500.0).abs() < 1.0, "got {d}");

        let bearing = bearing_degrees(start.lat, start.lon, moved.lat, moved.lon);
        assert!((bearing - 90.0).abs() < 1.0, "got {bearing}");
    }

    #[test]
    fn geofence_membership() {
        let fence = Geofence {
            id: "depot".into(),
            lat: -26.2041,
            lon: 28.0473,
            radius_meters: 200.0,
        };
        assert!(is_inside(&loc(-26.2041, 28.0473), &fence));

        let outside = move_location(loc(-26.2041, 28.0473), 0.0, 300.0);
        assert!(!is_inside(&outside, &fence));

        let fences = vec![fence];
        assert_eq!(inside_set(&loc(-26.2041, 28.0473), &fences), vec!["depot"]);
        assert!(inside_set(&outside, &fences).is_empty());
    }

    #[test]
    fn route_interpolation_endpoints_and_midpoint() {
        let route = vec![
            RoutePoint { lat: 0.0, lon: 0.0 },
            RoutePoint { lat: 1.0, lon: 1.0 },
            RoutePoint { lat: 1.0, lon: 2.0 },
        ];

        let start = interpolate_route(&route, 0.0).unwrap();
        assert_eq!((start.lat, start.lon), (0.0, 0.0));

        let end = interpolate_route(&route, 1.0).unwrap();
        assert_eq!((end.lat, end.lon), (1.0, 2.0));

        let mid = interpolate_route(&route, 0.5).unwrap();
        assert_eq!((mid.lat, mid.lon), (1.0, 1.0));

        // progress past the end clamps
        let clamped = interpolate_route(&route, 2.0).unwrap();
        assert_eq!((clamped.lat, clamped.lon), (1.0, 2.0));

        assert!(interpolate_route(&[], 0.5).is_none());
    }
}
