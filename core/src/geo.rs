use diesel::prelude::*;
use matchcore_shared::clients::db::DbPool;
use matchcore_shared::types::geo::{haversine_meters, GeoPoint};
use matchcore_shared::{CoreError, CoreResult};
use serde::Serialize;
use uuid::Uuid;

use crate::models::Circle;
use crate::schema::{circles, users};

/// A circle owned by someone other than the querying user, currently
/// effective and geometrically containing the query point.
#[derive(Debug, Clone, Serialize)]
pub struct NearbyCircle {
    pub circle_id: Uuid,
    pub owner_user_id: Uuid,
    pub radius_m: f64,
    pub objective: String,
    pub distance_m: f64,
}

/// Degrees of latitude per meter, used to widen the bounding-box prefilter.
/// Longitude degrees-per-meter varies with latitude, so the box is widened
/// generously and the exact filter (haversine) throws out false positives.
const METERS_PER_DEGREE_LAT: f64 = 111_320.0;

pub struct GeoIndex<'a> {
    pool: &'a DbPool,
    spatial_search_limit: i64,
}

impl<'a> GeoIndex<'a> {
    pub fn new(pool: &'a DbPool, spatial_search_limit: i64) -> Self {
        Self {
            pool,
            spatial_search_limit,
        }
    }

    /// Every currently-effective circle, owned by someone other than
    /// `user_id`, whose disk contains `point`, sorted by ascending distance
    /// and capped at `spatial_search_limit`.
    pub fn query_nearby(&self, user_id: Uuid, point: GeoPoint) -> CoreResult<Vec<NearbyCircle>> {
        let mut conn = self
            .pool
            .get()
            .map_err(|e| CoreError::Transient(format!("db pool exhausted: {e}")))?;

        let now = chrono::Utc::now();

        // Widen conservatively: the largest circle this platform configures
        // is bounded in practice, but there is no hard cap in the data model,
        // so the box uses a generous fixed margin rather than trying to
        // derive one from `radius_meters` per row (which would defeat the
        // point of a SQL-side prefilter).
        const MAX_CONSIDERED_RADIUS_M: f64 = 50_000.0;
        let lat_margin = MAX_CONSIDERED_RADIUS_M / METERS_PER_DEGREE_LAT;
        let lng_margin = MAX_CONSIDERED_RADIUS_M
            / (METERS_PER_DEGREE_LAT * point.lat.to_radians().cos().abs().max(0.01));

        let rows: Vec<(Circle, Option<f64>, Option<f64>)> = circles::table
            .inner_join(users::table.on(users::id.eq(circles::owner_user_id)))
            .filter(circles::owner_user_id.ne(user_id))
            .filter(circles::status.eq("active"))
            .filter(circles::start_at.le(now))
            .filter(
                circles::expires_at
                    .is_null()
                    .or(circles::expires_at.gt(now)),
            )
            .filter(users::latitude.is_not_null())
            .filter(users::longitude.is_not_null())
            .filter(users::latitude.between(point.lat - lat_margin, point.lat + lat_margin))
            .filter(users::longitude.between(point.lng - lng_margin, point.lng + lng_margin))
            .select((
                circles::all_columns,
                users::latitude,
                users::longitude,
            ))
            .load(&mut conn)
            .map_err(CoreError::Database)?;

        let mut nearby: Vec<NearbyCircle> = rows
            .into_iter()
            .filter_map(|(circle, lat, lng)| {
                let (lat, lng) = (lat?, lng?);
                let owner_point = GeoPoint::new(lat, lng).ok()?;
                let distance_m = haversine_meters(point, owner_point);
                if distance_m <= circle.radius_meters {
                    Some(NearbyCircle {
                        circle_id: circle.id,
                        owner_user_id: circle.owner_user_id,
                        radius_m: circle.radius_meters,
                        objective: circle.objective,
                        distance_m,
                    })
                } else {
                    None
                }
            })
            .collect();

        nearby.sort_by(|a, b| a.distance_m.partial_cmp(&b.distance_m).unwrap());
        nearby.truncate(self.spatial_search_limit as usize);

        Ok(nearby)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sorting_orders_by_ascending_distance() {
        let mut nearby = vec![
            NearbyCircle {
                circle_id: Uuid::new_v4(),
                owner_user_id: Uuid::new_v4(),
                radius_m: 500.0,
                objective: "far".into(),
                distance_m: 400.0,
            },
            NearbyCircle {
                circle_id: Uuid::new_v4(),
                owner_user_id: Uuid::new_v4(),
                radius_m: 500.0,
                objective: "near".into(),
                distance_m: 50.0,
            },
        ];
        nearby.sort_by(|a, b| a.distance_m.partial_cmp(&b.distance_m).unwrap());
        assert_eq!(nearby[0].objective, "near");
    }
}
