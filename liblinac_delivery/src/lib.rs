//! # linac_delivery
//!
//! linac_delivery reconstructs what a medical linear accelerator was asked to deliver, or
//! actually delivered, from the records left behind by planning, treatment and the linac
//! itself, and turns each of them into a common control point description. Deliveries can
//! then be compared by integrating them into meterset maps: 2-D grids of the monitor units
//! each point of the isocentre plane was exposed to.
//!
//! ## Sources
//!
//! - Monaco `tel.1` plan files
//! - DICOM RT plans, which can also be written back from a Delivery
//! - Elekta trajectory logs (`.trf`)
//! - Recorded iCom streams, as written by the iCom listener
//! - The Mosaiq database, through a caller supplied [`mosaiq::MosaiqCursor`]
//!
//! Every source is decoded into a [`delivery::Delivery`]: the cumulative monitor units,
//! gantry and collimator angles, leaf pair positions and jaw positions at each control point,
//! all in a single bipolar, mm based frame.
//!
//! ## Installation
//!
//! The only method of install is from source. If you have not used Rust before, see the
//! [Rust docs](https://www.rust-lang.org/tools/install) for installing the tool chain.
//!
//! To build and install the CLI use `cargo install --path ./linac_delivery_cli` from the top
//! level repository. Run `linac_delivery_cli --help` for its subcommands.
//!
//! ## Configuration
//!
//! The CLI and library share a YAML configuration. A template can be made with
//! `linac_delivery_cli new -p config.yml`:
//!
//! ```yml
//! grid_resolution: 1.0
//! max_leaf_gap: 400.0
//! mlc_model: Agility
//! leaf_pair_widths: null
//! min_step_per_pixel: 10
//! gantry_tolerance: 3.0
//! trf_codes_path: null
//! icom_port: 1706
//! icom_reads_per_flush: 120
//! icom_read_size: 16384
//! icom_reconnect_delay_secs: 5
//! mosaiq_utc_offset: '+00:00'
//! mosaiq_match_buffer_secs: 0
//! mosaiq_max_read_attempts: 10
//! output_path: null
//! ```
//!
//! `leaf_pair_widths` overrides the widths of the `mlc_model` when set. If `trf_codes_path`
//! is `null`, the linac state and wedge code table bundled with the library is used.
//!
//! ## Output
//!
//! Meterset maps are written to `output_path` as YAML, holding the map (rows along the jaw
//! axis, columns along the leaves) and the centre of every row and column in mm:
//!
//! ```text
//! version: liblinac_delivery:1.0
//! mlc: [-200.0, ..., 200.0]
//! jaw: [-200.5, ..., 200.5]
//! metersetmap: [[...], ...]
//! gantry_angle: null
//! normalisation: null
//! ```
pub mod config;
pub mod constants;
pub mod delivery;
pub mod dicom_plan;
pub mod error;
pub mod gantry_selector;
pub mod icom_extract;
pub mod icom_listener;
pub mod identify;
pub mod listener_status;
pub mod map_writer;
pub mod metersetmap;
pub mod monaco;
pub mod mosaiq;
pub mod process;
pub mod shared_file;
pub mod transforms;
pub mod trf_codes;
pub mod trf_file;
pub mod trf_header;
pub mod trf_table;
