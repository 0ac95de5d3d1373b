use geo_traits::{
    CoordTrait, Dimensions, GeometryCollectionTrait, GeometryTrait, LineStringTrait,
    MultiLineStringTrait, MultiPointTrait, MultiPolygonTrait, PointTrait, PolygonTrait,
};

/// Axis-aligned bounding box over X/Y, with optional Z and M ranges.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Envelope {
    pub min_x: f64,
    pub max_x: f64,
    pub min_y: f64,
    pub max_y: f64,
    pub z: Option<(f64, f64)>,
    pub m: Option<(f64, f64)>,
}

impl Envelope {
    pub fn new(min_x: f64, max_x: f64, min_y: f64, max_y: f64) -> Self {
        Self {
            min_x,
            max_x,
            min_y,
            max_y,
            z: None,
            m: None,
        }
    }

    fn from_coord(x: f64, y: f64, z: Option<f64>, m: Option<f64>) -> Self {
        Self {
            min_x: x,
            max_x: x,
            min_y: y,
            max_y: y,
            z: z.map(|v| (v, v)),
            m: m.map(|v| (v, v)),
        }
    }

    fn add_coord(&mut self, x: f64, y: f64, z: Option<f64>, m: Option<f64>) {
        self.min_x = self.min_x.min(x);
        self.max_x = self.max_x.max(x);
        self.min_y = self.min_y.min(y);
        self.max_y = self.max_y.max(y);
        if let Some(v) = z {
            self.z = Some(match self.z {
                Some((lo, hi)) => (lo.min(v), hi.max(v)),
                None => (v, v),
            });
        }
        if let Some(v) = m {
            self.m = Some(match self.m {
                Some((lo, hi)) => (lo.min(v), hi.max(v)),
                None => (v, v),
            });
        }
    }

    /// Grow this envelope to also cover `other`.
    pub fn union(&mut self, other: &Envelope) {
        self.min_x = self.min_x.min(other.min_x);
        self.max_x = self.max_x.max(other.max_x);
        self.min_y = self.min_y.min(other.min_y);
        self.max_y = self.max_y.max(other.max_y);
        self.z = match (self.z, other.z) {
            (Some((a, b)), Some((c, d))) => Some((a.min(c), b.max(d))),
            (z, None) | (None, z) => z,
        };
        self.m = match (self.m, other.m) {
            (Some((a, b)), Some((c, d))) => Some((a.min(c), b.max(d))),
            (m, None) | (None, m) => m,
        };
    }

    /// X/Y intersection test (closed intervals).
    pub fn intersects(&self, other: &Envelope) -> bool {
        self.min_x <= other.max_x
            && self.max_x >= other.min_x
            && self.min_y <= other.max_y
            && self.max_y >= other.min_y
    }

    /// True when `other` lies entirely within this envelope on X/Y.
    pub fn contains(&self, other: &Envelope) -> bool {
        other.min_x >= self.min_x
            && other.max_x <= self.max_x
            && other.min_y >= self.min_y
            && other.max_y <= self.max_y
    }
}

fn coord_zm<C: CoordTrait<T = f64>>(coord: &C) -> (Option<f64>, Option<f64>) {
    match coord.dim() {
        Dimensions::Xy | Dimensions::Unknown(2) => (None, None),
        Dimensions::Xyz | Dimensions::Unknown(3) => (Some(coord.nth_or_panic(2)), None),
        Dimensions::Xym => (None, Some(coord.nth_or_panic(2))),
        Dimensions::Xyzm | Dimensions::Unknown(4) => {
            (Some(coord.nth_or_panic(2)), Some(coord.nth_or_panic(3)))
        }
        Dimensions::Unknown(_) => (None, None),
    }
}

fn add<C: CoordTrait<T = f64>>(bounds: &mut Option<Envelope>, coord: &C) {
    let (x, y) = coord.x_y();
    let (z, m) = coord_zm(coord);
    match bounds {
        Some(env) => env.add_coord(x, y, z, m),
        None => *bounds = Some(Envelope::from_coord(x, y, z, m)),
    }
}

fn add_line_string<L: LineStringTrait<T = f64>>(bounds: &mut Option<Envelope>, line: &L) {
    for coord in line.coords() {
        add(bounds, &coord);
    }
}

/// Bounding box of every coordinate reachable from `geom`.
///
/// `None` means the geometry is empty. The traversal walks coordinates
/// through `geo-traits` without materializing an owned geometry.
pub(crate) fn bounds_of_geometry<G: GeometryTrait<T = f64>>(geom: &G) -> Option<Envelope> {
    use geo_traits::GeometryType as GeoType;

    let mut bounds: Option<Envelope> = None;
    match geom.as_type() {
        GeoType::Point(point) => {
            if let Some(coord) = point.coord() {
                add(&mut bounds, &coord);
            }
        }
        GeoType::LineString(line) => {
            add_line_string(&mut bounds, line);
        }
        GeoType::Polygon(poly) => {
            if let Some(ring) = poly.exterior() {
                add_line_string(&mut bounds, &ring);
            }
            for ring in poly.interiors() {
                add_line_string(&mut bounds, &ring);
            }
        }
        GeoType::MultiPoint(multi) => {
            for point in multi.points() {
                if let Some(coord) = point.coord() {
                    add(&mut bounds, &coord);
                }
            }
        }
        GeoType::MultiLineString(multi) => {
            for line in multi.line_strings() {
                add_line_string(&mut bounds, &line);
            }
        }
        GeoType::MultiPolygon(multi) => {
            for poly in multi.polygons() {
                if let Some(ring) = poly.exterior() {
                    add_line_string(&mut bounds, &ring);
                }
                for ring in poly.interiors() {
                    add_line_string(&mut bounds, &ring);
                }
            }
        }
        GeoType::GeometryCollection(collection) => {
            for sub_geom in collection.geometries() {
                if let Some(sub_bounds) = bounds_of_geometry(&sub_geom) {
                    match &mut bounds {
                        Some(env) => env.union(&sub_bounds),
                        None => bounds = Some(sub_bounds),
                    }
                }
            }
        }
        GeoType::Rect(_) | GeoType::Triangle(_) | GeoType::Line(_) => {
            // Not producible from WKB payloads.
            unreachable!()
        }
    }

    bounds
}
