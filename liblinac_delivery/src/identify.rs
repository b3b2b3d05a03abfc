use std::path::Path;

use time::macros::format_description;
use time::{Date, Month, OffsetDateTime, PrimitiveDateTime, Time, UtcOffset};

use super::config::Config;
use super::error::{IdentifyError, TrfError};
use super::mosaiq::{get_delivery_details, DeliveryDetails, MosaiqCursor};
use super::shared_file::read_shared;
use super::trf_header::TrfHeader;

/// A trajectory log matched to its Mosaiq treatment
#[derive(Debug, Clone, PartialEq)]
pub struct IdentifiedDelivery {
    pub details: DeliveryDetails,
    /// Delivery time in Mosaiq's timezone, YYYY-MM-DD HH:MM:SS
    pub local_time: String,
    /// The same time in a form safe for file names
    pub path_time: String,
}

fn parse_numbers(text: &str, separators: &[char]) -> Option<[u8; 3]> {
    let parts: Vec<u8> = text
        .split(|c| separators.contains(&c))
        .map(|part| part.parse::<u8>().ok())
        .collect::<Option<Vec<u8>>>()?;
    parts.try_into().ok()
}

/// Parse a trajectory log date, YY/MM/DD HH:MM:SS Z, as UTC
pub fn parse_header_date(date: &str) -> Result<OffsetDateTime, IdentifyError> {
    let bad_date = || IdentifyError::BadDate(date.to_string());
    let fields: Vec<&str> = date.split_whitespace().collect();
    let (day, clock) = match fields.as_slice() {
        [day, clock, "Z"] => (*day, *clock),
        _ => return Err(bad_date()),
    };
    let [year, month, day] = parse_numbers(day, &['/', '-']).ok_or_else(bad_date)?;
    let [hour, minute, second] = parse_numbers(clock, &[':']).ok_or_else(bad_date)?;

    let date = Date::from_calendar_date(2000 + i32::from(year), Month::try_from(month)?, day)?;
    let time = Time::from_hms(hour, minute, second)?;
    Ok(PrimitiveDateTime::new(date, time).assume_utc())
}

/// Convert a trajectory log date to Mosaiq local time, returning (query form, path form)
pub fn local_delivery_time(
    date: &str,
    offset: UtcOffset,
) -> Result<(String, String), IdentifyError> {
    let local = parse_header_date(date)?.to_offset(offset);
    let query = local.format(format_description!(
        "[year]-[month]-[day] [hour]:[minute]:[second]"
    ))?;
    let path = local.format(format_description!(
        "[year]-[month]-[day]_[hour][minute][second]"
    ))?;
    Ok((query, path))
}

/// Find the Mosaiq treatment a trajectory log header belongs to
pub fn identify_header<C: MosaiqCursor + ?Sized>(
    cursor: &mut C,
    header: &TrfHeader,
    config: &Config,
) -> Result<IdentifiedDelivery, IdentifyError> {
    if header.field_label.is_empty() {
        return Err(IdentifyError::NoFieldLabel);
    }

    let offset = config.get_mosaiq_utc_offset()?;
    let (local_time, path_time) = local_delivery_time(&header.date, offset)?;
    let details = get_delivery_details(
        cursor,
        &header.machine,
        &local_time,
        &header.field_label,
        &header.field_name,
        config.mosaiq_match_buffer_secs,
    )?;
    spdlog::info!(
        "Identified {}/{} at {local_time} as Mosaiq field {} (patient {})",
        header.field_label,
        header.field_name,
        details.field_id,
        details.patient_id
    );

    Ok(IdentifiedDelivery {
        details,
        local_time,
        path_time,
    })
}

/// Identify a trajectory log on disk from its header alone
pub fn identify_logfile<C: MosaiqCursor + ?Sized>(
    cursor: &mut C,
    path: &Path,
    config: &Config,
) -> Result<IdentifiedDelivery, IdentifyError> {
    let bytes = read_shared(path).map_err(TrfError::from)?;
    let header = TrfHeader::decode(&bytes)?;
    identify_header(cursor, &header, config)
}
