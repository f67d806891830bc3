//! ffmpeg filtergraph construction for the three merge methods.
//!
//! All graphs scale both inputs to a common height first, so mixed-source
//! footage merges cleanly, and end in a single labeled output `[v]`.

use super::calibration::Calibration;

/// Geometry both filter builders need: the common scale height and the
/// scaled width of each input.
#[derive(Debug, Clone, Copy)]
pub struct MergeGeometry {
    pub height: u32,
    pub left_width: u32,
    pub right_width: u32,
}

impl MergeGeometry {
    /// Common height is the smaller of the two inputs; widths follow at
    /// preserved aspect, forced even for the encoder.
    pub fn from_dimensions(
        left: (u32, u32),
        right: (u32, u32),
    ) -> MergeGeometry {
        let height = make_even(left.1.min(right.1));
        MergeGeometry {
            height,
            left_width: make_even(scale_width(left, height)),
            right_width: make_even(scale_width(right, height)),
        }
    }
}

fn scale_width((w, h): (u32, u32), target_height: u32) -> u32 {
    if h == 0 {
        return 0;
    }
    ((w as u64 * target_height as u64) / h as u64) as u32
}

fn make_even(v: u32) -> u32 {
    v & !1
}

/// Rotation applied to each frame before merging. Quarter turns use
/// `transpose` (lossless re-layout); anything else goes through `rotate`.
fn rotation_filter(degrees: i32) -> Option<String> {
    match degrees.rem_euclid(360) {
        0 => None,
        90 => Some("transpose=1".to_string()),
        180 => Some("hflip,vflip".to_string()),
        270 => Some("transpose=2".to_string()),
        d => Some(format!("rotate={d}*PI/180")),
    }
}

fn input_chain(index: usize, degrees: i32, height: u32, label: &str) -> String {
    match rotation_filter(degrees) {
        Some(rot) => format!("[{index}:v]{rot},scale=-2:{height}[{label}]"),
        None => format!("[{index}:v]scale=-2:{height}[{label}]"),
    }
}

/// Plain horizontal concatenation. Output width is the sum of the scaled
/// input widths.
pub fn side_by_side(degrees: i32, geometry: MergeGeometry) -> String {
    format!(
        "{};{};[l][r]hstack=inputs=2[v]",
        input_chain(0, degrees, geometry.height, "l"),
        input_chain(1, degrees, geometry.height, "r"),
    )
}

/// The minimal fallback-of-last-resort: no rotation, no blending, just
/// scale and hstack.
pub fn minimal_hstack(geometry: MergeGeometry) -> String {
    format!(
        "[0:v]scale=-2:{h}[l];[1:v]scale=-2:{h}[r];[l][r]hstack=inputs=2[v]",
        h = geometry.height
    )
}

/// Side-by-side with a linear alpha ramp across an `overlap`-pixel seam.
///
/// The seam strips are blended as
/// `out = (1 - i/overlap) * left + (i/overlap) * right` for column offset
/// `i`, so the ramp endpoints coincide with the untouched body regions on
/// both sides.
pub fn feather_blend(degrees: i32, overlap: u32, geometry: MergeGeometry) -> String {
    let h = geometry.height;
    format!(
        "{lin};{rin};\
         [l]split[lb][ls];\
         [lb]crop=iw-{overlap}:{h}:0:0[lbody];\
         [ls]crop={overlap}:{h}:iw-{overlap}:0[lseam];\
         [r]split[rs][rb];\
         [rs]crop={overlap}:{h}:0:0[rseam];\
         [rb]crop=iw-{overlap}:{h}:{overlap}:0[rbody];\
         [lseam][rseam]blend=all_expr='A*(1-X/W)+B*(X/W)'[seam];\
         [lbody][seam][rbody]hstack=inputs=3[v]",
        lin = input_chain(0, degrees, h, "l"),
        rin = input_chain(1, degrees, h, "r"),
    )
}

/// Whether the overlap fits both scaled frames; callers drop to plain
/// side-by-side when it does not.
pub fn overlap_fits(overlap: u32, geometry: MergeGeometry) -> bool {
    overlap > 0 && overlap < geometry.left_width && overlap < geometry.right_width
}

/// Homography stitch: pad both frames onto the output canvas, warp the
/// right frame with `perspective` using corners projected through the
/// calibration, then feather across the overlap band.
///
/// The caller has already validated the calibration; this only turns it
/// into filter text.
pub fn stitch(
    calibration: &Calibration,
    overlap: u32,
    geometry: MergeGeometry,
) -> String {
    let h = geometry.height;
    let lw = geometry.left_width;
    let rw = geometry.right_width;

    let corners = calibration.projected_corners(rw as f64, h as f64);
    // Canvas covers the warped right frame and the whole left frame;
    // with a real overlap this lands below the side-by-side width.
    let needed = corners
        .iter()
        .map(|(x, _)| x.ceil() as i64)
        .max()
        .unwrap_or(0)
        .max(lw as i64) as u32;
    let canvas_width = needed + (needed & 1);

    // Overlap band starts where the left frame ends, minus the feather
    let seam_start = lw.saturating_sub(overlap);
    let perspective: String = corners
        .iter()
        .enumerate()
        .map(|(i, (x, y))| format!("x{i}={x:.2}:y{i}={y:.2}"))
        .collect::<Vec<_>>()
        .join(":");

    format!(
        "[0:v]scale=-2:{h},pad={canvas_width}:{h}:0:0[base];\
         [1:v]scale=-2:{h},pad={canvas_width}:{h}:0:0,\
         perspective={perspective}:sense=destination[warped];\
         [base][warped]blend=all_expr='if(lte(X,{seam_start}),A,\
if(gte(X,{seam_end}),B,A*(1-(X-{seam_start})/{overlap})+B*((X-{seam_start})/{overlap})))'[v]",
        seam_end = seam_start + overlap,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn geometry() -> MergeGeometry {
        MergeGeometry::from_dimensions((1920, 1080), (1920, 1080))
    }

    #[test]
    fn geometry_scales_to_common_height() {
        let g = MergeGeometry::from_dimensions((1920, 1080), (1280, 720));
        assert_eq!(g.height, 720);
        assert_eq!(g.left_width, 1280);
        assert_eq!(g.right_width, 1280);
    }

    #[test]
    fn geometry_widths_are_even() {
        let g = MergeGeometry::from_dimensions((853, 480), (854, 480));
        assert_eq!(g.left_width % 2, 0);
        assert_eq!(g.right_width % 2, 0);
    }

    #[test]
    fn side_by_side_is_two_input_hstack() {
        let graph = side_by_side(0, geometry());
        assert!(graph.contains("hstack=inputs=2"));
        assert!(graph.contains("scale=-2:1080"));
        assert!(!graph.contains("transpose"));
    }

    #[test]
    fn quarter_turns_use_transpose() {
        assert_eq!(rotation_filter(90).as_deref(), Some("transpose=1"));
        assert_eq!(rotation_filter(270).as_deref(), Some("transpose=2"));
        assert_eq!(rotation_filter(180).as_deref(), Some("hflip,vflip"));
        assert_eq!(rotation_filter(0), None);
        assert_eq!(rotation_filter(360), None);
        assert!(rotation_filter(15).unwrap().contains("rotate"));
    }

    #[test]
    fn feather_blend_ramp_spans_overlap() {
        let graph = feather_blend(0, 100, geometry());
        assert!(graph.contains("crop=100:1080:iw-100:0"));
        assert!(graph.contains("A*(1-X/W)+B*(X/W)"));
        assert!(graph.contains("hstack=inputs=3"));
    }

    #[test]
    fn overlap_sanity_bounds() {
        let g = geometry();
        assert!(overlap_fits(100, g));
        assert!(!overlap_fits(0, g));
        assert!(!overlap_fits(1920, g));
    }

    #[test]
    fn stitch_projects_all_four_corners() {
        let cal = Calibration {
            homography: [[1.0, 0.0, 1650.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]],
            created_at: None,
            feature_count: None,
            inlier_ratio: None,
        };
        let graph = stitch(&cal, 100, geometry());
        assert!(graph.contains("perspective=x0=1650.00:y0=0.00"));
        assert!(graph.contains("x3="));
        assert!(graph.contains("sense=destination"));
        // Canvas must fit the shifted frame: 1650 + 1920, rounded even
        assert!(graph.contains("pad=3570:1080"));
    }

    #[test]
    fn stitch_seam_sits_at_left_edge_minus_overlap() {
        let cal = Calibration {
            homography: [[1.0, 0.0, 1800.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]],
            created_at: None,
            feature_count: None,
            inlier_ratio: None,
        };
        let graph = stitch(&cal, 120, geometry());
        assert!(graph.contains("lte(X,1800)"));
        assert!(graph.contains("gte(X,1920)"));
    }
}
