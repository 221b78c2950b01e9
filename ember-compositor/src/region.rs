// SPDX-License-Identifier: MPL-2.0-only

//! Rectangle-set algebra in the global compositor coordinate space.
//!
//! Damage, opaque and input regions are all sets of axis-aligned integer
//! rectangles. The operations here are total: empty regions are legal inputs
//! and outputs everywhere.
//!
//! Regions are stored in canonical y-x banded form: disjoint rectangles
//! grouped into horizontal bands, sorted by (y, x), with x-touching spans and
//! y-touching bands with identical spans merged. The canonical order is what
//! keeps [`Region::contains_point`] logarithmic.

use std::fmt;
use std::mem;

/// An axis-aligned rectangle with integer geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub w: i32,
    pub h: i32,
}

impl Rect {
    pub const fn new(x: i32, y: i32, w: i32, h: i32) -> Self {
        Self { x, y, w, h }
    }

    pub fn is_empty(&self) -> bool {
        self.w <= 0 || self.h <= 0
    }

    fn x2(&self) -> i32 {
        self.x + self.w
    }

    fn y2(&self) -> i32 {
        self.y + self.h
    }

    pub fn contains(&self, px: i32, py: i32) -> bool {
        px >= self.x && px < self.x2() && py >= self.y && py < self.y2()
    }

    pub fn translated(&self, dx: i32, dy: i32) -> Rect {
        Rect::new(self.x + dx, self.y + dy, self.w, self.h)
    }

    /// Grow the rectangle by `margin` on every side.
    pub fn inflated(&self, margin: i32) -> Rect {
        Rect::new(
            self.x - margin,
            self.y - margin,
            self.w + 2 * margin,
            self.h + 2 * margin,
        )
    }

    pub fn intersection(&self, other: &Rect) -> Option<Rect> {
        let x = self.x.max(other.x);
        let y = self.y.max(other.y);
        let x2 = self.x2().min(other.x2());
        let y2 = self.y2().min(other.y2());
        if x < x2 && y < y2 {
            Some(Rect::new(x, y, x2 - x, y2 - y))
        } else {
            None
        }
    }

    /// Split `self \ other` into at most four disjoint fragments.
    fn subtract(&self, other: &Rect) -> impl Iterator<Item = Rect> {
        let mut out = [Rect::default(); 4];
        let mut n = 0;
        match self.intersection(other) {
            None => {
                out[0] = *self;
                n = 1;
            }
            Some(hole) => {
                // Band above and below the hole, then the side slivers.
                if hole.y > self.y {
                    out[n] = Rect::new(self.x, self.y, self.w, hole.y - self.y);
                    n += 1;
                }
                if hole.y2() < self.y2() {
                    out[n] = Rect::new(self.x, hole.y2(), self.w, self.y2() - hole.y2());
                    n += 1;
                }
                if hole.x > self.x {
                    out[n] = Rect::new(self.x, hole.y, hole.x - self.x, hole.h);
                    n += 1;
                }
                if hole.x2() < self.x2() {
                    out[n] = Rect::new(hole.x2(), hole.y, self.x2() - hole.x2(), hole.h);
                    n += 1;
                }
            }
        }
        out.into_iter().take(n)
    }
}

/// Rebuild canonical banded form from an arbitrary (possibly overlapping)
/// rectangle soup. Bands are delimited by every distinct top/bottom edge in
/// the input; within a band the covering x spans are merged, and a band whose
/// spans equal the previous, touching band is folded into it.
fn canonicalize(input: &[Rect]) -> Vec<Rect> {
    let mut edges: Vec<i32> = input
        .iter()
        .filter(|r| !r.is_empty())
        .flat_map(|r| [r.y, r.y2()])
        .collect();
    edges.sort_unstable();
    edges.dedup();

    let mut out: Vec<Rect> = Vec::new();
    let mut prev = 0..0;
    let mut spans: Vec<(i32, i32)> = Vec::new();
    let mut merged: Vec<(i32, i32)> = Vec::new();

    for window in edges.windows(2) {
        let (top, bottom) = (window[0], window[1]);

        spans.clear();
        spans.extend(
            input
                .iter()
                .filter(|r| !r.is_empty() && r.y <= top && r.y2() >= bottom)
                .map(|r| (r.x, r.x2())),
        );
        if spans.is_empty() {
            continue;
        }
        spans.sort_unstable();

        // Merge spans that overlap or touch.
        merged.clear();
        for &(x1, x2) in &spans {
            match merged.last_mut() {
                Some(last) if x1 <= last.1 => last.1 = last.1.max(x2),
                _ => merged.push((x1, x2)),
            }
        }

        let band = out.len();
        for &(x1, x2) in &merged {
            out.push(Rect::new(x1, top, x2 - x1, bottom - top));
        }

        // Fold into the previous band when it touches and the spans line up.
        let width = out.len() - band;
        if width == prev.len()
            && !prev.is_empty()
            && out[prev.start].y2() == top
            && (0..width).all(|i| {
                let a = out[prev.start + i];
                let b = out[band + i];
                a.x == b.x && a.w == b.w
            })
        {
            let grow = bottom - top;
            out.truncate(band);
            for rect in &mut out[prev.clone()] {
                rect.h += grow;
            }
        } else {
            prev = band..out.len();
        }
    }
    out
}

/// A set of rectangles in canonical banded form; the set of covered points is
/// what is meaningful, and equal coverage compares equal.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Region {
    rects: Vec<Rect>,
}

impl Region {
    pub const fn new() -> Self {
        Self { rects: Vec::new() }
    }

    pub fn from_rect(rect: Rect) -> Self {
        let mut region = Region::new();
        region.union_rect(&rect);
        region
    }

    pub fn is_empty(&self) -> bool {
        self.rects.is_empty()
    }

    pub fn clear(&mut self) {
        self.rects.clear();
    }

    /// The rectangles in canonical order: disjoint, banded, sorted by (y, x).
    pub fn rects(&self) -> &[Rect] {
        &self.rects
    }

    pub fn union(&mut self, other: &Region) {
        if other.is_empty() {
            return;
        }
        let mut rects = mem::take(&mut self.rects);
        rects.extend_from_slice(&other.rects);
        self.rects = canonicalize(&rects);
    }

    pub fn union_rect(&mut self, rect: &Rect) {
        if rect.is_empty() {
            return;
        }
        let mut rects = mem::take(&mut self.rects);
        rects.push(*rect);
        self.rects = canonicalize(&rects);
    }

    pub fn intersect_rect(&self, rect: &Rect) -> Region {
        let clipped: Vec<Rect> = self
            .rects
            .iter()
            .filter_map(|r| r.intersection(rect))
            .collect();
        Region {
            rects: canonicalize(&clipped),
        }
    }

    pub fn intersect(&self, other: &Region) -> Region {
        let mut clipped = Vec::new();
        for a in &self.rects {
            for b in &other.rects {
                if let Some(i) = a.intersection(b) {
                    clipped.push(i);
                }
            }
        }
        Region {
            rects: canonicalize(&clipped),
        }
    }

    pub fn subtract(&mut self, other: &Region) {
        if self.rects.is_empty() || other.is_empty() {
            return;
        }
        let mut rects = mem::take(&mut self.rects);
        for hole in &other.rects {
            rects = rects.iter().flat_map(|r| r.subtract(hole)).collect();
        }
        self.rects = canonicalize(&rects);
    }

    pub fn subtract_rect(&mut self, rect: &Rect) {
        if rect.is_empty() || self.rects.is_empty() {
            return;
        }
        let rects: Vec<Rect> = self.rects.iter().flat_map(|r| r.subtract(rect)).collect();
        self.rects = canonicalize(&rects);
    }

    pub fn translate(&mut self, dx: i32, dy: i32) {
        for r in &mut self.rects {
            *r = r.translated(dx, dy);
        }
    }

    /// Point-in-set test, O(log rects): one binary search over the canonical
    /// (y, x) order locates the only rectangle that could contain the point.
    pub fn contains_point(&self, x: i32, y: i32) -> bool {
        let index = self
            .rects
            .partition_point(|r| r.y2() <= y || (r.y <= y && r.x2() <= x));
        self.rects.get(index).is_some_and(|r| r.contains(x, y))
    }

    /// Bounding box of the covered area. Empty regions yield an empty rect.
    pub fn extents(&self) -> Rect {
        let mut iter = self.rects.iter();
        let first = match iter.next() {
            Some(r) => *r,
            None => return Rect::default(),
        };
        let (mut x, mut y, mut x2, mut y2) = (first.x, first.y, first.x2(), first.y2());
        for r in iter {
            x = x.min(r.x);
            y = y.min(r.y);
            x2 = x2.max(r.x2());
            y2 = y2.max(r.y2());
        }
        Rect::new(x, y, x2 - x, y2 - y)
    }

    /// True when every point of `other` is also covered by `self`.
    pub fn covers(&self, other: &Region) -> bool {
        let mut rest = other.clone();
        rest.subtract(self);
        rest.is_empty()
    }

    /// True when both regions cover exactly the same set of points.
    pub fn same_coverage(&self, other: &Region) -> bool {
        self.covers(other) && other.covers(self)
    }
}

impl From<Rect> for Region {
    fn from(rect: Rect) -> Self {
        Region::from_rect(rect)
    }
}

impl fmt::Debug for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.rects.iter()).finish()
    }
}
