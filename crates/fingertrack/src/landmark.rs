//! Landmark storage shared by all detectors.

type Position = [f32; 3];

/// An ordered list of landmarks.
///
/// The meaning of each index is defined by the network that produced the landmarks (see
/// [`LandmarkIdx`][crate::hand::LandmarkIdx] for hands).
#[derive(Debug, Clone, PartialEq)]
pub struct Landmarks {
    positions: Box<[Position]>,
}

impl Landmarks {
    /// Creates a new [`Landmarks`] collection containing `len` preallocated landmarks.
    ///
    /// All landmarks will start with all coordinates at `0.0`.
    pub fn new(len: usize) -> Self {
        Self {
            positions: vec![[0.0, 0.0, 0.0]; len].into_boxed_slice(),
        }
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = Landmark> + Clone + '_ {
        self.positions.iter().map(|&pos| Landmark::new(pos))
    }

    /// Returns the landmark at `index`, or [`None`] if there are not enough landmarks.
    pub fn get(&self, index: usize) -> Option<Landmark> {
        self.positions.get(index).map(|&pos| Landmark::new(pos))
    }

    pub fn set(&mut self, index: usize, landmark: Landmark) {
        self.positions[index] = landmark.pos;
    }

    pub fn positions_mut(&mut self) -> &mut [Position] {
        &mut self.positions
    }

    pub fn map_positions(&mut self, mut f: impl FnMut(Position) -> Position) {
        for pos in self.positions_mut() {
            *pos = f(*pos);
        }
    }
}

impl FromIterator<Landmark> for Landmarks {
    fn from_iter<T: IntoIterator<Item = Landmark>>(iter: T) -> Self {
        Self {
            positions: iter.into_iter().map(|lm| lm.pos).collect(),
        }
    }
}

/// A landmark in normalized image coordinates, with a relative depth value.
#[derive(Debug, PartialEq, PartialOrd, Clone, Copy)]
pub struct Landmark {
    pos: Position,
}

impl Landmark {
    pub fn new(position: Position) -> Self {
        Self { pos: position }
    }

    #[inline]
    pub fn x(&self) -> f32 {
        self.pos[0]
    }

    #[inline]
    pub fn y(&self) -> f32 {
        self.pos[1]
    }

    #[inline]
    pub fn z(&self) -> f32 {
        self.pos[2]
    }

    /// Computes the euclidean distance to `other` in the X/Y image plane, ignoring depth.
    pub fn planar_distance(&self, other: &Landmark) -> f32 {
        (self.x() - other.x()).hypot(self.y() - other.y())
    }
}
