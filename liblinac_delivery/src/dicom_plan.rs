//! DICOM RT plans as Deliveries, and Deliveries written back into an RT plan template.
//!
//! Only MLCX leaves paired with ASYMY jaws are supported. Control point attributes a plan
//! leaves out (gantry, collimator, device positions) carry over from the control point
//! before them.
use dicom_core::value::{DataSetSequence, PrimitiveValue};
use dicom_core::{DataElement, Tag, VR};
use dicom_dictionary_std::tags;
use dicom_object::mem::InMemElement;
use dicom_object::{open_file, InMemDicomObject};
use ndarray::Array2;
use std::path::Path;

use super::constants::DEFAULT_GANTRY_TOLERANCE;
use super::delivery::Delivery;
use super::error::DicomPlanError;
use super::transforms::{bipolar_to_iec, iec_to_bipolar, round_decimals};

const MLC_DEVICE: &str = "MLCX";
const JAW_DEVICE: &str = "ASYMY";
const WEIGHT_DECIMALS: i32 = 6;
const DS_DECIMALS: i32 = 6;
/// Largest difference, in MU, between a delivered and a planned beam meterset
const METERSET_MATCH_TOLERANCE: f64 = 0.5;

/// A beam referenced by a fraction group, with its planned meterset
struct ReferencedBeam<'a> {
    beam: &'a InMemDicomObject,
    reference: &'a InMemDicomObject,
    meterset: f64,
}

fn element<'a>(
    obj: &'a InMemDicomObject,
    tag: Tag,
    name: &str,
) -> Result<&'a InMemElement, DicomPlanError> {
    obj.get(tag)
        .ok_or_else(|| DicomPlanError::MissingAttribute(name.to_string()))
}

fn items<'a>(
    obj: &'a InMemDicomObject,
    tag: Tag,
    name: &str,
) -> Result<&'a [InMemDicomObject], DicomPlanError> {
    element(obj, tag, name)?
        .items()
        .ok_or_else(|| DicomPlanError::MissingAttribute(name.to_string()))
}

fn float(obj: &InMemDicomObject, tag: Tag, name: &str) -> Result<f64, DicomPlanError> {
    Ok(element(obj, tag, name)?.to_float64()?)
}

fn optional_float(obj: &InMemDicomObject, tag: Tag) -> Result<Option<f64>, DicomPlanError> {
    Ok(obj.get(tag).map(|elem| elem.to_float64()).transpose()?)
}

fn floats(obj: &InMemDicomObject, tag: Tag, name: &str) -> Result<Vec<f64>, DicomPlanError> {
    Ok(element(obj, tag, name)?.to_multi_float64()?)
}

fn int(obj: &InMemDicomObject, tag: Tag, name: &str) -> Result<i64, DicomPlanError> {
    Ok(element(obj, tag, name)?.to_int::<i64>()?)
}

fn text(obj: &InMemDicomObject, tag: Tag, name: &str) -> Result<String, DicomPlanError> {
    Ok(element(obj, tag, name)?.to_str()?.trim().to_string())
}

fn format_ds(value: f64) -> String {
    format!("{}", round_decimals(value, DS_DECIMALS))
}

fn ds(tag: Tag, value: f64) -> InMemElement {
    DataElement::new(tag, VR::DS, PrimitiveValue::from(format_ds(value)))
}

fn ds_multi(tag: Tag, values: &[f64]) -> InMemElement {
    let strings: Vec<String> = values.iter().map(|value| format_ds(*value)).collect();
    DataElement::new(tag, VR::DS, PrimitiveValue::Strs(strings.into()))
}

fn is(tag: Tag, value: i64) -> InMemElement {
    DataElement::new(tag, VR::IS, PrimitiveValue::from(value.to_string()))
}

fn cs(tag: Tag, value: &str) -> InMemElement {
    DataElement::new(tag, VR::CS, PrimitiveValue::from(value))
}

fn sequence(tag: Tag, items: Vec<InMemDicomObject>) -> InMemElement {
    DataElement::new(tag, VR::SQ, DataSetSequence::from(items))
}

/// Resolve an attribute at every control point, carrying the last seen value forward.
///
/// Only the first control point is required to hold it.
fn lean_on_prior<'a, T: Clone>(
    control_points: &'a [InMemDicomObject],
    name: &str,
    get: impl Fn(&'a InMemDicomObject) -> Result<Option<T>, DicomPlanError>,
) -> Result<Vec<T>, DicomPlanError> {
    let mut current: Option<T> = None;
    control_points
        .iter()
        .map(|control_point| {
            if let Some(value) = get(control_point)? {
                current = Some(value);
            }
            current
                .clone()
                .ok_or_else(|| DicomPlanError::MissingAttribute(name.to_string()))
        })
        .collect()
}

fn fraction_group_number(group: &InMemDicomObject) -> Result<i64, DicomPlanError> {
    int(group, tags::FRACTION_GROUP_NUMBER, "FractionGroupNumber")
}

/// The fraction group numbers of a plan
pub fn fraction_group_numbers(plan: &InMemDicomObject) -> Result<Vec<i64>, DicomPlanError> {
    items(plan, tags::FRACTION_GROUP_SEQUENCE, "FractionGroupSequence")?
        .iter()
        .map(fraction_group_number)
        .collect()
}

fn select_fraction_group(
    plan: &InMemDicomObject,
    number: Option<i64>,
) -> Result<&InMemDicomObject, DicomPlanError> {
    let groups = items(plan, tags::FRACTION_GROUP_SEQUENCE, "FractionGroupSequence")?;
    match number {
        Some(number) => {
            for group in groups {
                if fraction_group_number(group)? == number {
                    return Ok(group);
                }
            }
            Err(DicomPlanError::UnknownFractionGroup(number))
        }
        None => match groups {
            [only] => Ok(only),
            _ => Err(DicomPlanError::AmbiguousFractionGroup(
                fraction_group_numbers(plan)?,
            )),
        },
    }
}

fn referenced_beams<'a>(
    plan: &'a InMemDicomObject,
    group: &'a InMemDicomObject,
) -> Result<Vec<ReferencedBeam<'a>>, DicomPlanError> {
    let beams = items(plan, tags::BEAM_SEQUENCE, "BeamSequence")?;
    items(group, tags::REFERENCED_BEAM_SEQUENCE, "ReferencedBeamSequence")?
        .iter()
        .map(|reference| {
            let number = int(reference, tags::REFERENCED_BEAM_NUMBER, "ReferencedBeamNumber")?;
            let meterset = float(reference, tags::BEAM_METERSET, "BeamMeterset")?;
            let mut beam = None;
            for candidate in beams {
                if int(candidate, tags::BEAM_NUMBER, "BeamNumber")? == number {
                    beam = Some(candidate);
                    break;
                }
            }
            let beam = beam.ok_or(DicomPlanError::UnknownBeam(number))?;
            Ok(ReferencedBeam {
                beam,
                reference,
                meterset,
            })
        })
        .collect()
}

fn device_positions(
    position_sequence: &[InMemDicomObject],
    device: &str,
    expected: usize,
) -> Result<Vec<f64>, DicomPlanError> {
    let mut matching = Vec::new();
    for item in position_sequence {
        if text(
            item,
            tags::RT_BEAM_LIMITING_DEVICE_TYPE,
            "RTBeamLimitingDeviceType",
        )? == device
        {
            matching.push(item);
        }
    }
    let [item] = matching.as_slice() else {
        return Err(DicomPlanError::DeviceCount {
            device: device.to_string(),
            found: matching.len(),
        });
    };
    let positions = floats(item, tags::LEAF_JAW_POSITIONS, "LeafJawPositions")?;
    if positions.len() != expected {
        return Err(DicomPlanError::BadPositions {
            device: device.to_string(),
            found: positions.len(),
            expected,
        });
    }
    Ok(positions)
}

/// Number of MLCX leaf pairs of a beam, after checking its devices are MLCX and ASYMY
fn leaf_pairs(beam: &InMemDicomObject) -> Result<usize, DicomPlanError> {
    let devices = items(
        beam,
        tags::BEAM_LIMITING_DEVICE_SEQUENCE,
        "BeamLimitingDeviceSequence",
    )?;
    let mut types = devices
        .iter()
        .map(|device| {
            text(
                device,
                tags::RT_BEAM_LIMITING_DEVICE_TYPE,
                "RTBeamLimitingDeviceType",
            )
        })
        .collect::<Result<Vec<String>, DicomPlanError>>()?;
    let mut kinds = types.clone();
    kinds.sort();
    kinds.dedup();
    if kinds != [JAW_DEVICE, MLC_DEVICE] || types.len() != 2 {
        types.sort();
        return Err(DicomPlanError::UnsupportedDevices(types));
    }

    let mut mlc = None;
    for (device, kind) in devices.iter().zip(types.iter()) {
        if kind == MLC_DEVICE {
            mlc = Some(device);
        }
    }
    let mlc = mlc.ok_or_else(|| DicomPlanError::MissingAttribute(MLC_DEVICE.to_string()))?;
    let boundaries = floats(mlc, tags::LEAF_POSITION_BOUNDARIES, "LeafPositionBoundaries")?;
    let pairs = boundaries.len().saturating_sub(1);
    let declared = int(mlc, tags::NUMBER_OF_LEAF_JAW_PAIRS, "NumberOfLeafJawPairs")?;
    if declared != pairs as i64 {
        return Err(DicomPlanError::LeafCountMismatch {
            declared,
            boundaries: pairs,
        });
    }
    Ok(pairs)
}

fn delivery_from_beam(beam: &InMemDicomObject, meterset: f64) -> Result<Delivery, DicomPlanError> {
    let number = int(beam, tags::BEAM_NUMBER, "BeamNumber")?;
    let pairs = leaf_pairs(beam)?;
    let control_points = items(beam, tags::CONTROL_POINT_SEQUENCE, "ControlPointSequence")?;

    let final_weight = float(
        beam,
        tags::FINAL_CUMULATIVE_METERSET_WEIGHT,
        "FinalCumulativeMetersetWeight",
    )?;
    if final_weight == 0.0 {
        return Err(DicomPlanError::ZeroFinalWeight(number));
    }
    let mu = control_points
        .iter()
        .map(|control_point| {
            let weight = float(
                control_point,
                tags::CUMULATIVE_METERSET_WEIGHT,
                "CumulativeMetersetWeight",
            )?;
            Ok(meterset * weight / final_weight)
        })
        .collect::<Result<Vec<f64>, DicomPlanError>>()?;

    let gantry = lean_on_prior(control_points, "GantryAngle", |cp| {
        optional_float(cp, tags::GANTRY_ANGLE)
    })?;
    let collimator = lean_on_prior(control_points, "BeamLimitingDeviceAngle", |cp| {
        optional_float(cp, tags::BEAM_LIMITING_DEVICE_ANGLE)
    })?;
    let positions = lean_on_prior(
        control_points,
        "BeamLimitingDevicePositionSequence",
        |cp| {
            Ok(cp
                .get(tags::BEAM_LIMITING_DEVICE_POSITION_SEQUENCE)
                .and_then(|elem| elem.items()))
        },
    )?;

    let mut mlc = Vec::with_capacity(positions.len());
    let mut jaw = Vec::with_capacity(positions.len());
    for position_sequence in positions.iter() {
        let leaves = device_positions(position_sequence, MLC_DEVICE, 2 * pairs)?;
        mlc.push(Array2::from_shape_fn((pairs, 2), |(pair, bank)| {
            if bank == 0 {
                leaves[2 * pairs - 1 - pair]
            } else {
                -leaves[pairs - 1 - pair]
            }
        }));
        let jaws = device_positions(position_sequence, JAW_DEVICE, 2)?;
        jaw.push([jaws[1], -jaws[0]]);
    }

    Ok(Delivery::from_control_points(
        mu,
        iec_to_bipolar(&gantry)?,
        iec_to_bipolar(&collimator)?,
        &mlc,
        &jaw,
    )?)
}

/// Build the Delivery of one fraction group of an RT plan.
///
/// The beams of the group are combined in the order the group references them, each scaled
/// from its cumulative meterset weights to its BeamMeterset. Without a fraction group number
/// the plan must hold exactly one group.
pub fn delivery_from_dicom_plan(
    plan: &InMemDicomObject,
    fraction_group: Option<i64>,
) -> Result<Delivery, DicomPlanError> {
    let group = select_fraction_group(plan, fraction_group)?;
    let deliveries = referenced_beams(plan, group)?
        .iter()
        .map(|referenced| delivery_from_beam(referenced.beam, referenced.meterset))
        .collect::<Result<Vec<Delivery>, DicomPlanError>>()?;
    let delivery = Delivery::combine(&deliveries)?;
    spdlog::info!(
        "Read {} beams, {} control points and {:.1} MU from fraction group {}",
        deliveries.len(),
        delivery.len(),
        delivery.total_mu(),
        fraction_group_number(group)?
    );
    Ok(delivery)
}

/// Read an RT plan file into a Delivery
pub fn delivery_from_dicom_file(
    path: &Path,
    fraction_group: Option<i64>,
) -> Result<Delivery, DicomPlanError> {
    if !path.exists() {
        return Err(DicomPlanError::BadFilePath(path.to_path_buf()));
    }
    let plan = open_file(path)?;
    delivery_from_dicom_plan(&plan, fraction_group)
}

/// The single gantry angle of a static gantry beam, in bipolar degrees
fn beam_gantry_angle(beam: &InMemDicomObject) -> Result<f64, DicomPlanError> {
    let control_points = items(beam, tags::CONTROL_POINT_SEQUENCE, "ControlPointSequence")?;
    let angles = lean_on_prior(control_points, "GantryAngle", |cp| {
        optional_float(cp, tags::GANTRY_ANGLE)
    })?;
    let angles = iec_to_bipolar(&angles)?;
    let first = angles
        .first()
        .copied()
        .ok_or_else(|| DicomPlanError::MissingAttribute("GantryAngle".to_string()))?;
    if angles.iter().any(|angle| *angle != first) {
        return Err(DicomPlanError::MultipleGantryAngles(int(
            beam,
            tags::BEAM_NUMBER,
            "BeamNumber",
        )?));
    }
    Ok(first)
}

/// The gantry tolerance that keeps the windows around each beam angle apart: just under half
/// the smallest separation, capped at the default tolerance
pub fn gantry_tolerance(angles: &[f64]) -> Result<f64, DicomPlanError> {
    let mut sorted = angles.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let mut min_diff = f64::INFINITY;
    for pair in sorted.windows(2) {
        if pair[1] == pair[0] {
            return Err(DicomPlanError::SharedGantryAngle(pair[0]));
        }
        min_diff = min_diff.min(pair[1] - pair[0]);
    }
    Ok((min_diff / 2.0 - 0.1).min(DEFAULT_GANTRY_TOLERANCE))
}

fn group_angles(beams: &[ReferencedBeam]) -> Result<Vec<f64>, DicomPlanError> {
    beams
        .iter()
        .map(|referenced| beam_gantry_angle(referenced.beam))
        .collect()
}

/// Find the fraction group whose beam metersets the delivery reproduces, beam by beam
fn matching_fraction_group(
    delivery: &Delivery,
    plan: &InMemDicomObject,
) -> Result<i64, DicomPlanError> {
    let groups = items(plan, tags::FRACTION_GROUP_SEQUENCE, "FractionGroupSequence")?;
    if let [only] = groups {
        return fraction_group_number(only);
    }

    let mut matches = Vec::new();
    for group in groups {
        let beams = referenced_beams(plan, group)?;
        let angles = group_angles(&beams)?;
        let delivered = delivery.metersets(&angles, gantry_tolerance(&angles)?)?;
        let matched = delivered.len() == beams.len()
            && delivered
                .iter()
                .zip(beams.iter())
                .all(|(mu, referenced)| (mu - referenced.meterset).abs() <= METERSET_MATCH_TOLERANCE);
        if matched {
            matches.push(fraction_group_number(group)?);
        }
    }
    match matches.as_slice() {
        [number] => Ok(*number),
        [] => Err(DicomPlanError::NoMatchingFractionGroup),
        _ => Err(DicomPlanError::AmbiguousFractionGroup(matches)),
    }
}

fn rotation_directions(angles: &[f64]) -> Vec<&'static str> {
    let mut directions: Vec<&'static str> = angles
        .windows(2)
        .map(|pair| {
            let diff = pair[1] - pair[0];
            if diff > 0.0 {
                "CW"
            } else if diff < 0.0 {
                "CC"
            } else {
                "NONE"
            }
        })
        .collect();
    directions.push("NONE");
    directions
}

fn device_position(device: &str, positions: &[f64]) -> InMemDicomObject {
    InMemDicomObject::from_element_iter([
        cs(tags::RT_BEAM_LIMITING_DEVICE_TYPE, device),
        ds_multi(tags::LEAF_JAW_POSITIONS, positions),
    ])
}

/// Rebuild a template beam's control points from a single-angle Delivery.
///
/// The first template control point seeds the first new one, the last seeds the rest.
fn beam_from_delivery(
    template: &InMemDicomObject,
    delivery: &Delivery,
    angle: f64,
) -> Result<InMemDicomObject, DicomPlanError> {
    let template_points = items(
        template,
        tags::CONTROL_POINT_SEQUENCE,
        "ControlPointSequence",
    )?;
    let (Some(initial), Some(subsequent)) = (template_points.first(), template_points.last())
    else {
        return Err(DicomPlanError::MissingAttribute(
            "ControlPointSequence".to_string(),
        ));
    };
    if delivery.is_empty() {
        return Err(DicomPlanError::EmptyBeam(angle));
    }

    let gantry = bipolar_to_iec(delivery.gantry());
    let gantry_directions = rotation_directions(delivery.gantry());
    let collimator = bipolar_to_iec(delivery.collimator());
    let collimator_directions = rotation_directions(delivery.collimator());
    let total = delivery.total_mu();
    let mlc = delivery.mlc();
    let jaw = delivery.jaw();
    let pairs = delivery.num_leaf_pairs();

    let control_points = (0..delivery.len())
        .map(|idx| {
            let mut control_point = if idx == 0 {
                initial.clone()
            } else {
                subsequent.clone()
            };
            let weight = if total > 0.0 {
                round_decimals(delivery.monitor_units()[idx] / total, WEIGHT_DECIMALS)
            } else {
                0.0
            };
            let leaves: Vec<f64> = (0..pairs)
                .map(|pair| -mlc[[idx, pairs - 1 - pair, 1]])
                .chain((0..pairs).map(|pair| mlc[[idx, pairs - 1 - pair, 0]]))
                .collect();
            let jaws = [-jaw[[idx, 1]], jaw[[idx, 0]]];

            control_point.put(is(tags::CONTROL_POINT_INDEX, idx as i64));
            control_point.put(ds(tags::CUMULATIVE_METERSET_WEIGHT, weight));
            control_point.put(ds(tags::GANTRY_ANGLE, gantry[idx]));
            control_point.put(cs(tags::GANTRY_ROTATION_DIRECTION, gantry_directions[idx]));
            control_point.put(ds(tags::BEAM_LIMITING_DEVICE_ANGLE, collimator[idx]));
            control_point.put(cs(
                tags::BEAM_LIMITING_DEVICE_ROTATION_DIRECTION,
                collimator_directions[idx],
            ));
            control_point.put(sequence(
                tags::BEAM_LIMITING_DEVICE_POSITION_SEQUENCE,
                vec![
                    device_position(JAW_DEVICE, &jaws),
                    device_position(MLC_DEVICE, &leaves),
                ],
            ));
            control_point
        })
        .collect::<Vec<InMemDicomObject>>();

    let mut beam = template.clone();
    beam.put(is(tags::NUMBER_OF_CONTROL_POINTS, control_points.len() as i64));
    beam.put(ds(tags::FINAL_CUMULATIVE_METERSET_WEIGHT, 1.0));
    beam.put(sequence(tags::CONTROL_POINT_SEQUENCE, control_points));
    Ok(beam)
}

/// Write a Delivery into a copy of an RT plan template.
///
/// The template's fraction group supplies one static gantry angle per beam; the delivery is
/// split around those angles and each part replaces the control points and BeamMeterset of
/// its beam. The result holds only that fraction group. Without a fraction group number the
/// group whose metersets the delivery matches is used.
pub fn delivery_to_dicom_plan(
    delivery: &Delivery,
    template: &InMemDicomObject,
    fraction_group: Option<i64>,
) -> Result<InMemDicomObject, DicomPlanError> {
    let filtered = delivery.filter_irrelevant();
    let number = match fraction_group {
        Some(number) => number,
        None => matching_fraction_group(&filtered, template)?,
    };
    let group = select_fraction_group(template, Some(number))?;
    let beams = referenced_beams(template, group)?;
    let angles = group_angles(&beams)?;
    let tolerance = gantry_tolerance(&angles)?;
    let parts = filtered.mask_by_gantry(&angles, tolerance, false)?;

    let mut new_beams = Vec::with_capacity(beams.len());
    let mut new_references = Vec::with_capacity(beams.len());
    for ((referenced, part), angle) in beams.iter().zip(parts.iter()).zip(angles.iter()) {
        new_beams.push(beam_from_delivery(referenced.beam, part, *angle)?);
        let mut reference = referenced.reference.clone();
        reference.put(DataElement::new(
            tags::BEAM_METERSET,
            VR::DS,
            PrimitiveValue::from(format!("{:.6}", part.total_mu())),
        ));
        new_references.push(reference);
    }

    let mut group = group.clone();
    group.put(sequence(tags::REFERENCED_BEAM_SEQUENCE, new_references));
    let mut plan = template.clone();
    plan.put(sequence(tags::FRACTION_GROUP_SEQUENCE, vec![group]));
    plan.put(sequence(tags::BEAM_SEQUENCE, new_beams));
    spdlog::info!(
        "Wrote {} beams into fraction group {number} of the plan template",
        beams.len()
    );
    Ok(plan)
}
