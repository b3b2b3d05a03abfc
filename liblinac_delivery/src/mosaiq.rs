//! Mosaiq adapter.
//!
//! The database connection is owned by the caller and handed in through [`MosaiqCursor`].
//! Reads are repeated until consecutive results agree, as Mosaiq occasionally returns rows
//! that are still being written.
use byteorder::{ByteOrder, LittleEndian};
use ndarray::{Array2, Array3};

use super::constants::{CM_TO_MM, MOSAIQ_LEAF_UNITS_PER_CM, MOSAIQ_ODD_BYTE_PAD};
use super::delivery::Delivery;
use super::error::MosaiqError;
use super::transforms::{clamped_cumulative, iec_to_bipolar};

pub type Rows = Vec<Vec<SqlValue>>;

/// A single cell returned by Mosaiq
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
}

fn unexpected(column: &str, value: &SqlValue) -> MosaiqError {
    MosaiqError::UnexpectedValue {
        column: column.to_string(),
        value: format!("{value:?}"),
    }
}

impl SqlValue {
    pub fn as_f64(&self, column: &str) -> Result<f64, MosaiqError> {
        match self {
            Self::Float(value) => Ok(*value),
            Self::Int(value) => Ok(*value as f64),
            other => Err(unexpected(column, other)),
        }
    }

    pub fn as_i64(&self, column: &str) -> Result<i64, MosaiqError> {
        match self {
            Self::Int(value) => Ok(*value),
            other => Err(unexpected(column, other)),
        }
    }

    pub fn as_bool(&self, column: &str) -> Result<bool, MosaiqError> {
        match self {
            Self::Bool(value) => Ok(*value),
            Self::Int(value) => Ok(*value != 0),
            other => Err(unexpected(column, other)),
        }
    }

    /// Text columns, with NULL read as empty
    pub fn as_text(&self, column: &str) -> Result<String, MosaiqError> {
        match self {
            Self::Text(value) => Ok(value.clone()),
            Self::Int(value) => Ok(value.to_string()),
            Self::Null => Ok(String::new()),
            other => Err(unexpected(column, other)),
        }
    }

    pub fn as_bytes(&self, column: &str) -> Result<&[u8], MosaiqError> {
        match self {
            Self::Bytes(value) => Ok(value),
            other => Err(unexpected(column, other)),
        }
    }
}

/// Anything able to run a parameterised query against Mosaiq.
///
/// Parameters are referenced in the SQL as `%(name)s`.
pub trait MosaiqCursor {
    fn execute(&mut self, sql: &str, params: &[(&str, SqlValue)]) -> Result<Rows, MosaiqError>;
}

/// Mosaiq TxField.Type_Enum values
pub const FIELD_TYPES: [(i64, &str); 19] = [
    (0, ""),
    (1, "Static"),
    (2, "StepNShoot"),
    (3, "Setup"),
    (4, "kV Setup"),
    (5, "CT"),
    (6, "Port"),
    (7, "Fixed"),
    (8, "Dynamic"),
    (9, "MV CT"),
    (11, "Arc"),
    (12, "Skip Arcs"),
    (13, "VMAT"),
    (14, "DMLC"),
    (15, "Helical"),
    (16, "Fixed Angle"),
    (17, "Path"),
    (18, "Shot"),
    (21, "ITD"),
];

pub fn field_type_name(code: i64) -> Result<&'static str, MosaiqError> {
    FIELD_TYPES
        .iter()
        .find(|(value, _)| *value == code)
        .map(|(_, name)| *name)
        .ok_or(MosaiqError::UnknownFieldType(code))
}

const TXFIELD_METERSET_QUERY: &str = "
    SELECT
        TxField.Meterset
    FROM TxField
    WHERE
        TxField.FLD_ID = %(field_id)s
    ";

const TXFIELDPOINT_QUERY: &str = "
    SELECT
        TxFieldPoint.[Index],
        TxFieldPoint.A_Leaf_Set,
        TxFieldPoint.B_Leaf_Set,
        TxFieldPoint.Gantry_Ang,
        TxFieldPoint.Coll_Ang,
        TxFieldPoint.Coll_Y1,
        TxFieldPoint.Coll_Y2
    FROM TxFieldPoint
    WHERE
        TxFieldPoint.FLD_ID = %(field_id)s
    ORDER BY
        TxFieldPoint.Point
    ";

const FIELD_TYPE_QUERY: &str = "
    SELECT
        TxField.Type_Enum
    FROM TxField
    WHERE
        TxField.FLD_ID = %(field_id)s
    ";

const DELIVERY_DETAILS_QUERY: &str = "
    SELECT
        Ident.IDA,
        TxField.FLD_ID,
        Patient.Last_Name,
        Patient.First_Name,
        Tracktreatment.WasQAMode,
        TxField.Type_Enum,
        Tracktreatment.WasBeamComplete
    FROM TrackTreatment, Ident, Patient, TxField, Staff
    WHERE
        TrackTreatment.Pat_ID1 = Ident.Pat_ID1 AND
        Patient.Pat_ID1 = Ident.Pat_ID1 AND
        TrackTreatment.FLD_ID = TxField.FLD_ID AND
        Staff.Staff_ID = TrackTreatment.Machine_ID_Staff_ID AND
        REPLACE(Staff.Last_Name, ' ', '') = %(machine)s AND
        TrackTreatment.Create_DtTm <= DATEADD(second, %(buffer)s, %(delivery_time)s) AND
        TrackTreatment.Edit_DtTm >= DATEADD(second, -%(buffer)s, %(delivery_time)s) AND
        TxField.Field_Label = %(field_label)s AND
        TxField.Field_Name = %(field_name)s
    ";

const PATIENT_NAME_QUERY: &str = "
    SELECT
        Patient.Last_Name,
        Patient.First_Name
    FROM Ident, Patient
    WHERE
        Patient.Pat_ID1 = Ident.Pat_ID1 AND
        Ident.IDA = %(patient_id)s
    ";

const PATIENT_FIELDS_QUERY: &str = "
    SELECT
        TxField.FLD_ID,
        TxField.Field_Label,
        TxField.Field_Name,
        TxField.Version,
        TxField.Meterset,
        TxField.Type_Enum,
        Site.Site_Name
    FROM Ident, TxField, Site
    WHERE
        TxField.Pat_ID1 = Ident.Pat_ID1 AND
        TxField.SIT_Set_ID = Site.SIT_Set_ID AND
        Ident.IDA = %(patient_id)s
    ";

const TREATMENTS_QUERY: &str = "
    SELECT
        Ident.IDA,
        Patient.Last_Name,
        Patient.First_Name,
        TxField.FLD_ID,
        TxField.Field_Label,
        TxField.Field_Name,
        TxField.Type_Enum,
        TxField.Meterset,
        TxField.Version,
        Tracktreatment.WasQAMode,
        Tracktreatment.WasBeamComplete,
        TrackTreatment.Create_DtTm,
        TrackTreatment.Edit_DtTm
    FROM TrackTreatment, Ident, Patient, TxField, Staff
    WHERE
        TrackTreatment.Pat_ID1 = Ident.Pat_ID1 AND
        Patient.Pat_ID1 = Ident.Pat_ID1 AND
        TrackTreatment.FLD_ID = TxField.FLD_ID AND
        Staff.Staff_ID = TrackTreatment.Machine_ID_Staff_ID AND
        REPLACE(Staff.Last_Name, ' ', '') = %(machine)s AND
        TrackTreatment.Edit_DtTm >= %(start)s AND
        TrackTreatment.Create_DtTm <= %(end)s
    ";

fn cell<'a>(row: &'a [SqlValue], idx: usize, column: &str) -> Result<&'a SqlValue, MosaiqError> {
    row.get(idx).ok_or_else(|| MosaiqError::UnexpectedValue {
        column: column.to_string(),
        value: format!("row of {} columns", row.len()),
    })
}

/// Repeat a query until two consecutive reads agree
pub fn read_consistent<C: MosaiqCursor + ?Sized>(
    cursor: &mut C,
    sql: &str,
    params: &[(&str, SqlValue)],
    max_attempts: usize,
) -> Result<Rows, MosaiqError> {
    let mut previous = cursor.execute(sql, params)?;
    for attempt in 2..=max_attempts.max(2) {
        let current = cursor.execute(sql, params)?;
        if current == previous {
            return Ok(current);
        }
        spdlog::warn!("Mosaiq read {attempt} disagreed with the previous read, reading again");
        previous = current;
    }
    Err(MosaiqError::ReadInconsistent(max_attempts))
}

/// Decode one leaf blob of little-endian i16 (1/100 cm) to cm
pub fn decode_leaf_blob(blob: &[u8]) -> Vec<f64> {
    let mut bytes = blob.to_vec();
    if bytes.len() % 2 == 1 {
        bytes.push(MOSAIQ_ODD_BYTE_PAD);
    }
    let mut values = vec![0i16; bytes.len() / 2];
    LittleEndian::read_i16_into(&bytes, &mut values);
    values
        .iter()
        .map(|v| f64::from(*v) / MOSAIQ_LEAF_UNITS_PER_CM)
        .collect()
}

/// Decode one bank across all control points as (control points, leaves) in cm
pub fn decode_leaf_blobs(blobs: &[&[u8]]) -> Result<Array2<f64>, MosaiqError> {
    let mut lengths: Vec<usize> = blobs.iter().map(|blob| blob.len()).collect();
    lengths.sort_unstable();
    lengths.dedup();
    if lengths.len() > 1 {
        return Err(MosaiqError::UnequalBlobLengths(lengths));
    }

    let decoded: Vec<Vec<f64>> = blobs.iter().map(|blob| decode_leaf_blob(blob)).collect();
    let n_leaves = decoded.first().map(|leaves| leaves.len()).unwrap_or(0);
    let flat: Vec<f64> = decoded.into_iter().flatten().collect();
    Array2::from_shape_vec((blobs.len(), n_leaves), flat)
        .map_err(|e| MosaiqError::DeliveryError(e.into()))
}

/// Query the total meterset and control points of a field
pub fn fetch_field_data<C: MosaiqCursor + ?Sized>(
    cursor: &mut C,
    field_id: i64,
    max_attempts: usize,
) -> Result<(f64, Rows), MosaiqError> {
    let params = [("field_id", SqlValue::Int(field_id))];
    let txfield = read_consistent(cursor, TXFIELD_METERSET_QUERY, &params, max_attempts)?;
    if txfield.len() != 1 {
        return Err(MosaiqError::BadTxFieldRows(txfield.len()));
    }
    let total_mu = cell(&txfield[0], 0, "Meterset")?.as_f64("Meterset")?;

    let points = read_consistent(cursor, TXFIELDPOINT_QUERY, &params, max_attempts)?;
    if points.is_empty() {
        return Err(MosaiqError::NoFieldPoints(field_id));
    }
    Ok((total_mu, points))
}

/// Build a Delivery from the rows of the TxFieldPoint query
pub fn delivery_from_field_points(total_mu: f64, points: &Rows) -> Result<Delivery, MosaiqError> {
    let mut cumulative = Vec::with_capacity(points.len());
    let mut a_blobs = Vec::with_capacity(points.len());
    let mut b_blobs = Vec::with_capacity(points.len());
    let mut gantry = Vec::with_capacity(points.len());
    let mut collimator = Vec::with_capacity(points.len());
    let mut jaw = Array2::<f64>::zeros((points.len(), 2));

    for (idx, row) in points.iter().enumerate() {
        cumulative.push(cell(row, 0, "Index")?.as_f64("Index")? * total_mu / 100.0);
        a_blobs.push(cell(row, 1, "A_Leaf_Set")?.as_bytes("A_Leaf_Set")?);
        b_blobs.push(cell(row, 2, "B_Leaf_Set")?.as_bytes("B_Leaf_Set")?);
        gantry.push(cell(row, 3, "Gantry_Ang")?.as_f64("Gantry_Ang")?);
        collimator.push(cell(row, 4, "Coll_Ang")?.as_f64("Coll_Ang")?);
        let y1 = cell(row, 5, "Coll_Y1")?.as_f64("Coll_Y1")?;
        let y2 = cell(row, 6, "Coll_Y2")?.as_f64("Coll_Y2")?;
        jaw[[idx, 0]] = CM_TO_MM * y2;
        jaw[[idx, 1]] = -CM_TO_MM * y1;
    }

    let a = decode_leaf_blobs(&a_blobs)?;
    let b = decode_leaf_blobs(&b_blobs)?;
    let n_leaves = a.ncols();
    if b.ncols() != n_leaves {
        return Err(MosaiqError::UnequalBlobLengths(vec![
            a_blobs.first().map(|blob| blob.len()).unwrap_or(0),
            b_blobs.first().map(|blob| blob.len()).unwrap_or(0),
        ]));
    }

    // Leaf order is reversed relative to the canonical frame
    let mut mlc = Array3::<f64>::zeros((points.len(), n_leaves, 2));
    for cp in 0..points.len() {
        for leaf in 0..n_leaves {
            let source = n_leaves - 1 - leaf;
            mlc[[cp, leaf, 0]] = CM_TO_MM * b[[cp, source]];
            mlc[[cp, leaf, 1]] = -CM_TO_MM * a[[cp, source]];
        }
    }

    Ok(Delivery::new(
        clamped_cumulative(&cumulative),
        iec_to_bipolar(&gantry)?,
        iec_to_bipolar(&collimator)?,
        mlc,
        jaw,
    )?)
}

fn deliveries_agree(first: &Delivery, second: &Delivery) -> bool {
    first.monitor_units() == second.monitor_units()
        && first.mlc() == second.mlc()
        && first.jaw() == second.jaw()
}

/// Read the planned Delivery of a Mosaiq field.
///
/// The field is read and decoded twice and only returned once both decodes agree.
pub fn delivery_from_mosaiq<C: MosaiqCursor + ?Sized>(
    cursor: &mut C,
    field_id: i64,
    max_attempts: usize,
) -> Result<Delivery, MosaiqError> {
    for attempt in 1..=max_attempts {
        let (total_mu, points) = fetch_field_data(cursor, field_id, max_attempts)?;
        let first = delivery_from_field_points(total_mu, &points)?;
        let (total_mu, points) = fetch_field_data(cursor, field_id, max_attempts)?;
        let second = delivery_from_field_points(total_mu, &points)?;
        if deliveries_agree(&first, &second) {
            spdlog::info!(
                "Decoded {} Mosaiq control points for field {field_id} ({} MU)",
                first.len(),
                first.total_mu()
            );
            return Ok(first);
        }
        spdlog::warn!("Mosaiq field {field_id} decoded differently on attempt {attempt}, retrying");
    }
    Err(MosaiqError::ReadInconsistent(max_attempts))
}

/// The patient and field a delivery belongs to
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryDetails {
    pub patient_id: String,
    pub field_id: i64,
    pub last_name: String,
    pub first_name: String,
    pub qa_mode: bool,
    pub field_type: String,
    pub beam_completed: bool,
}

impl DeliveryDetails {
    fn from_row(row: &[SqlValue]) -> Result<Self, MosaiqError> {
        Ok(Self {
            patient_id: cell(row, 0, "IDA")?.as_text("IDA")?,
            field_id: cell(row, 1, "FLD_ID")?.as_i64("FLD_ID")?,
            last_name: cell(row, 2, "Last_Name")?.as_text("Last_Name")?,
            first_name: cell(row, 3, "First_Name")?.as_text("First_Name")?,
            qa_mode: cell(row, 4, "WasQAMode")?.as_bool("WasQAMode")?,
            field_type: field_type_name(cell(row, 5, "Type_Enum")?.as_i64("Type_Enum")?)?
                .to_string(),
            beam_completed: cell(row, 6, "WasBeamComplete")?.as_bool("WasBeamComplete")?,
        })
    }
}

/// Find the field delivered on a machine at a time (Mosaiq local, YYYY-MM-DD HH:MM:SS).
///
/// Treatments are matched when the time falls within buffer seconds of their recorded span.
/// A wide buffer that finds disagreeing rows is narrowed to zero before giving up.
pub fn get_delivery_details<C: MosaiqCursor + ?Sized>(
    cursor: &mut C,
    machine: &str,
    delivery_time: &str,
    field_label: &str,
    field_name: &str,
    buffer: i64,
) -> Result<DeliveryDetails, MosaiqError> {
    let params = [
        ("buffer", SqlValue::Int(buffer)),
        ("machine", SqlValue::Text(machine.to_string())),
        ("delivery_time", SqlValue::Text(delivery_time.to_string())),
        ("field_label", SqlValue::Text(field_label.to_string())),
        ("field_name", SqlValue::Text(field_name.to_string())),
    ];
    let rows = cursor.execute(DELIVERY_DETAILS_QUERY, &params)?;

    let first = match rows.first() {
        Some(row) => row,
        None => {
            return Err(MosaiqError::NoEntries {
                label: field_label.to_string(),
                name: field_name.to_string(),
                time: delivery_time.to_string(),
            })
        }
    };
    if rows.iter().any(|row| row != first) {
        if buffer != 0 {
            spdlog::debug!("Disagreeing Mosaiq entries with a {buffer}s buffer, retrying with none");
            return get_delivery_details(cursor, machine, delivery_time, field_label, field_name, 0);
        }
        return Err(MosaiqError::MultipleEntries {
            label: field_label.to_string(),
            name: field_name.to_string(),
            time: delivery_time.to_string(),
        });
    }

    DeliveryDetails::from_row(first)
}

pub fn get_field_type<C: MosaiqCursor + ?Sized>(
    cursor: &mut C,
    field_id: i64,
) -> Result<&'static str, MosaiqError> {
    let rows = cursor.execute(FIELD_TYPE_QUERY, &[("field_id", SqlValue::Int(field_id))])?;
    let row = rows.first().ok_or(MosaiqError::BadTxFieldRows(0))?;
    field_type_name(cell(row, 0, "Type_Enum")?.as_i64("Type_Enum")?)
}

fn title_case(name: &str) -> String {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
        None => String::new(),
    }
}

/// Patient name as LAST, First
pub fn get_patient_name<C: MosaiqCursor + ?Sized>(
    cursor: &mut C,
    patient_id: &str,
) -> Result<String, MosaiqError> {
    let mut rows = cursor.execute(
        PATIENT_NAME_QUERY,
        &[("patient_id", SqlValue::Text(patient_id.to_string()))],
    )?;
    rows.dedup();
    match rows.as_slice() {
        [] => Err(MosaiqError::NoPatient(patient_id.to_string())),
        [row] => {
            let last = cell(row, 0, "Last_Name")?.as_text("Last_Name")?;
            let first = cell(row, 1, "First_Name")?.as_text("First_Name")?;
            Ok(format!("{}, {}", last.to_uppercase(), title_case(&first)))
        }
        _ => Err(MosaiqError::MultiplePatients(patient_id.to_string())),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PatientField {
    pub field_id: i64,
    pub field_label: String,
    pub field_name: String,
    pub field_version: i64,
    pub monitor_units: f64,
    pub field_type: String,
    pub site: String,
}

pub fn get_patient_fields<C: MosaiqCursor + ?Sized>(
    cursor: &mut C,
    patient_id: &str,
) -> Result<Vec<PatientField>, MosaiqError> {
    let rows = cursor.execute(
        PATIENT_FIELDS_QUERY,
        &[("patient_id", SqlValue::Text(patient_id.to_string()))],
    )?;
    let mut fields: Vec<PatientField> = Vec::new();
    for row in rows.iter() {
        let field = PatientField {
            field_id: cell(row, 0, "FLD_ID")?.as_i64("FLD_ID")?,
            field_label: cell(row, 1, "Field_Label")?.as_text("Field_Label")?,
            field_name: cell(row, 2, "Field_Name")?.as_text("Field_Name")?,
            field_version: cell(row, 3, "Version")?.as_i64("Version")?,
            monitor_units: cell(row, 4, "Meterset")?.as_f64("Meterset")?,
            field_type: field_type_name(cell(row, 5, "Type_Enum")?.as_i64("Type_Enum")?)?
                .to_string(),
            site: cell(row, 6, "Site_Name")?.as_text("Site_Name")?,
        };
        if !fields.contains(&field) {
            fields.push(field);
        }
    }
    Ok(fields)
}

#[derive(Debug, Clone, PartialEq)]
pub struct Treatment {
    pub patient_id: String,
    pub last_name: String,
    pub first_name: String,
    pub field_id: i64,
    pub field_label: String,
    pub field_name: String,
    pub field_type: String,
    pub monitor_units: f64,
    pub field_version: i64,
    pub qa_mode: bool,
    pub completed: bool,
    pub start: String,
    pub end: String,
}

/// Treatments on a machine overlapping start..end, ordered by start
pub fn get_treatments<C: MosaiqCursor + ?Sized>(
    cursor: &mut C,
    start: &str,
    end: &str,
    machine: &str,
) -> Result<Vec<Treatment>, MosaiqError> {
    let rows = cursor.execute(
        TREATMENTS_QUERY,
        &[
            ("machine", SqlValue::Text(machine.to_string())),
            ("start", SqlValue::Text(start.to_string())),
            ("end", SqlValue::Text(end.to_string())),
        ],
    )?;
    let mut treatments = rows
        .iter()
        .map(|row| -> Result<Treatment, MosaiqError> {
            Ok(Treatment {
                patient_id: cell(row, 0, "IDA")?.as_text("IDA")?,
                last_name: cell(row, 1, "Last_Name")?.as_text("Last_Name")?,
                first_name: cell(row, 2, "First_Name")?.as_text("First_Name")?,
                field_id: cell(row, 3, "FLD_ID")?.as_i64("FLD_ID")?,
                field_label: cell(row, 4, "Field_Label")?.as_text("Field_Label")?,
                field_name: cell(row, 5, "Field_Name")?.as_text("Field_Name")?,
                field_type: field_type_name(cell(row, 6, "Type_Enum")?.as_i64("Type_Enum")?)?
                    .to_string(),
                monitor_units: cell(row, 7, "Meterset")?.as_f64("Meterset")?,
                field_version: cell(row, 8, "Version")?.as_i64("Version")?,
                qa_mode: cell(row, 9, "WasQAMode")?.as_bool("WasQAMode")?,
                completed: cell(row, 10, "WasBeamComplete")?.as_bool("WasBeamComplete")?,
                start: cell(row, 11, "Create_DtTm")?.as_text("Create_DtTm")?,
                end: cell(row, 12, "Edit_DtTm")?.as_text("Edit_DtTm")?,
            })
        })
        .collect::<Result<Vec<_>, _>>()?;
    treatments.sort_by(|a, b| a.start.cmp(&b.start));
    Ok(treatments)
}
