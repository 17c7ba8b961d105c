use std::{collections::BTreeSet, fmt};

use crate::{
    layout::{AddressMap, AddressSpace},
    Error, Result,
};

/// A labelled byte range declared by a decoded component.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Region {
    /// First byte, in `space`
    pub start: u64,
    /// Number of bytes
    pub length: u64,
    /// Human readable label
    pub label: String,
    /// Address space `start` is expressed in
    pub space: AddressSpace,
}

impl Region {
    /// A region given as a file offset.
    pub fn file(start: impl Into<u64>, length: impl Into<u64>, label: impl Into<String>) -> Region {
        Region {
            start: start.into(),
            length: length.into(),
            label: label.into(),
            space: AddressSpace::FileOffset,
        }
    }

    /// A region given as an RVA.
    pub fn rva(start: impl Into<u64>, length: impl Into<u64>, label: impl Into<String>) -> Region {
        Region {
            start: start.into(),
            length: length.into(),
            label: label.into(),
            space: AddressSpace::Rva,
        }
    }

    /// One past the last byte, in `space`.
    #[must_use]
    pub fn end(&self) -> u64 {
        self.start.saturating_add(self.length)
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [{} {:#x}..{:#x}]",
            self.label,
            self.space,
            self.start,
            self.end()
        )
    }
}

/// One elementary sub-range of the file and the regions covering it, outermost first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    /// First file offset
    pub start: u64,
    /// One past the last file offset
    pub end: u64,
    /// Labels of the covering regions, outermost first
    pub labels: Vec<String>,
}

impl Segment {
    /// Returns `true` if no region covers this segment.
    #[must_use]
    pub fn is_gap(&self) -> bool {
        self.labels.is_empty()
    }

    /// Label of the innermost covering region.
    #[must_use]
    pub fn innermost(&self) -> Option<&str> {
        self.labels.last().map(String::as_str)
    }
}

/// Result of a successful region sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegionReport {
    /// All sub-ranges between consecutive boundaries, in file order
    pub segments: Vec<Segment>,
}

impl RegionReport {
    /// Sub-ranges no region covers.
    pub fn gaps(&self) -> impl Iterator<Item = &Segment> {
        self.segments.iter().filter(|segment| segment.is_gap())
    }

    /// Sub-ranges covered by a region with the given label.
    pub fn covered_by<'a>(&'a self, label: &'a str) -> impl Iterator<Item = &'a Segment> + 'a {
        self.segments
            .iter()
            .filter(move |segment| segment.labels.iter().any(|l| l == label))
    }
}

impl fmt::Display for RegionReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for segment in &self.segments {
            write!(f, "{:#010x}..{:#010x}", segment.start, segment.end)?;
            if segment.is_gap() {
                writeln!(f, "  (gap)")?;
            } else {
                writeln!(f, "  {}", segment.labels.join(" > "))?;
            }
        }
        Ok(())
    }
}

#[derive(Debug)]
struct Span<'a> {
    start: u64,
    end: u64,
    label: &'a str,
}

/// Checks that the regions form a proper nesting over the file.
///
/// RVA regions are normalized to file offsets through `map`; zero-length regions are
/// ignored. The file is cut at `0`, `file_size` and every region boundary. Within each
/// resulting sub-range the covering regions, ordered by start ascending and end
/// descending, must form a containment chain. Uncovered sub-ranges are reported as gaps,
/// not errors.
///
/// # Errors
/// Returns an [`crate::Error::Address`] if an RVA region start cannot be translated, and
/// [`Error::RegionConflict`] for the first pair of partially overlapping regions.
///
/// # Examples
///
/// ```rust
/// use pescope::layout::{validate_regions, AddressMap, Region};
///
/// let regions = [
///     Region::file(0x000_u32, 0x100_u32, "A"),
///     Region::file(0x100_u32, 0x100_u32, "B"),
///     Region::file(0x120_u32, 0x010_u32, "B.inner"),
/// ];
/// let report = validate_regions(&regions, 0x200, &AddressMap::default())?;
///
/// assert_eq!(report.gaps().count(), 0);
/// assert_eq!(report.segments[2].labels, ["B", "B.inner"]);
/// # Ok::<(), pescope::Error>(())
/// ```
pub fn validate_regions(
    regions: &[Region],
    file_size: u64,
    map: &AddressMap,
) -> Result<RegionReport> {
    let mut spans = Vec::with_capacity(regions.len());
    for region in regions {
        if region.length == 0 {
            continue;
        }

        let start = match region.space {
            AddressSpace::FileOffset => region.start,
            AddressSpace::Rva => {
                let rva = u32::try_from(region.start).map_err(|_| {
                    crate::AddressError::Unmapped {
                        value: region.start,
                        space: AddressSpace::Rva,
                    }
                })?;
                u64::from(map.rva_to_offset(rva)?)
            }
        };

        spans.push(Span {
            start,
            end: start.saturating_add(region.length),
            label: &region.label,
        });
    }

    spans.sort_by(|a, b| a.start.cmp(&b.start).then(b.end.cmp(&a.end)));

    let mut boundaries = BTreeSet::new();
    boundaries.insert(0);
    boundaries.insert(file_size);
    for span in &spans {
        boundaries.insert(span.start);
        boundaries.insert(span.end);
    }

    let boundaries: Vec<u64> = boundaries.into_iter().collect();
    let mut report = RegionReport::default();

    for pair in boundaries.windows(2) {
        let (start, end) = (pair[0], pair[1]);
        let covering: Vec<&Span<'_>> = spans
            .iter()
            .filter(|span| span.start <= start && span.end >= end)
            .collect();

        for chain in covering.windows(2) {
            let (outer, inner) = (chain[0], chain[1]);
            if inner.end > outer.end {
                return Err(Error::RegionConflict {
                    first: outer.label.to_string(),
                    second: inner.label.to_string(),
                    start,
                    end,
                });
            }
        }

        let labels: Vec<String> = covering.iter().map(|span| span.label.to_string()).collect();
        if labels.is_empty() {
            log::debug!("{start:#010x}..{end:#010x} (gap)");
        } else {
            log::debug!("{start:#010x}..{end:#010x} {}", labels.join(" > "));
        }

        report.segments.push(Segment { start, end, labels });
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{layout::SectionSpan, AddressError};

    #[test]
    fn disjoint_regions() {
        let regions = [
            Region::file(0x000_u32, 0x100_u32, "A"),
            Region::file(0x100_u32, 0x100_u32, "B"),
        ];
        let report = validate_regions(&regions, 0x200, &AddressMap::default()).unwrap();
        assert_eq!(report.segments.len(), 2);
        assert_eq!(report.gaps().count(), 0);
    }

    #[test]
    fn partial_overlap_conflicts() {
        let regions = [
            Region::file(0x000_u32, 0x100_u32, "A"),
            Region::file(0x100_u32, 0x100_u32, "B"),
            Region::file(0x050_u32, 0x100_u32, "C"),
        ];
        match validate_regions(&regions, 0x200, &AddressMap::default()) {
            Err(Error::RegionConflict {
                first,
                second,
                start,
                end,
            }) => {
                assert_eq!(first, "A");
                assert_eq!(second, "C");
                assert_eq!((start, end), (0x50, 0x100));
            }
            other => panic!("expected a region conflict, got {other:?}"),
        }
    }

    #[test]
    fn nesting_and_gaps() {
        let regions = [
            Region::file(0x000_u32, 0x40_u32, "Outer"),
            Region::file(0x000_u32, 0x40_u32, "Same"),
            Region::file(0x010_u32, 0x10_u32, "Inner"),
            Region::file(0x080_u32, 0x00_u32, "Empty"),
        ];
        let report = validate_regions(&regions, 0x100, &AddressMap::default()).unwrap();

        let boundaries: Vec<(u64, u64)> = report.segments.iter().map(|s| (s.start, s.end)).collect();
        assert_eq!(
            boundaries,
            [(0x00, 0x10), (0x10, 0x20), (0x20, 0x40), (0x40, 0x100)]
        );
        assert_eq!(report.segments[1].innermost(), Some("Inner"));
        assert_eq!(report.segments[1].labels.len(), 3);
        assert_eq!(report.gaps().count(), 1);
        assert_eq!(report.covered_by("Outer").count(), 3);
    }

    #[test]
    fn rva_regions_are_normalized() {
        let map = AddressMap::new(vec![SectionSpan::new(0x400, 0x200, 0x1000, 0x200)]);
        let regions = [
            Region::file(0x400_u32, 0x200_u32, "Raw data (.text)"),
            Region::rva(0x1010_u32, 0x20_u32, "Table"),
        ];
        let report = validate_regions(&regions, 0x600, &map).unwrap();
        let table: Vec<&Segment> = report.covered_by("Table").collect();
        assert_eq!(table.len(), 1);
        assert_eq!((table[0].start, table[0].end), (0x410, 0x430));
        assert_eq!(table[0].labels, ["Raw data (.text)", "Table"]);
    }

    #[test]
    fn unmapped_rva_region() {
        let regions = [Region::rva(0x5000_u32, 0x10_u32, "Nowhere")];
        assert!(matches!(
            validate_regions(&regions, 0x100, &AddressMap::default()),
            Err(Error::Address(AddressError::Unmapped { .. }))
        ));
    }
}
