// Copyright 2025-2026 CEMAXECUTER LLC

use std::ffi::CString;
use std::os::raw::{c_char, c_double, c_int, c_void};
use std::ptr;

use num_complex::{Complex32, Complex64};

use crate::{Interrogator, RadioConfig};

// UHD C API FFI bindings (manual, minimal)

type UhdError = c_int;
const UHD_ERROR_NONE: UhdError = 0;

// Opaque handle types
type UhdUsrpHandle = *mut c_void;
type UhdRxStreamerHandle = *mut c_void;
type UhdTxStreamerHandle = *mut c_void;
type UhdRxMetadataHandle = *mut c_void;
type UhdTxMetadataHandle = *mut c_void;
type UhdSubdevSpecHandle = *mut c_void;
type UhdStringVectorHandle = *mut c_void;

// Tune request policy
const UHD_TUNE_REQUEST_POLICY_AUTO: c_int = 65;

// Stream modes
const UHD_STREAM_MODE_NUM_SAMPS_AND_DONE: c_int = 100;

// RX metadata error codes
const UHD_RX_METADATA_ERROR_CODE_NONE: c_int = 0x0;

/// TX front-end tuning offset. Tuning the transmitter straight onto the
/// center frequency puts its LO spur in the middle of the receive band of
/// interest; the pulse is synthesized this far below the TX LO instead.
const TX_TUNE_OFFSET_HZ: f64 = 200_000.0;

/// Gap between the end of the activation pulse and the start of the
/// receive gather, microseconds. Covers the transponder turnaround.
const RX_TURNAROUND_US: f64 = 105.0;

/// Lead subtracted from the pulse spacing when queueing the timed
/// commands, so they reach the device comfortably before they fire.
const COMMAND_LEAD_US: f64 = 15_000.0;

fn us_to_sec(us: f64) -> f64 {
    us / 1_000_000.0
}

#[repr(C)]
struct UhdTuneRequest {
    target_freq: c_double,
    rf_freq_policy: c_int,
    rf_freq: c_double,
    dsp_freq_policy: c_int,
    dsp_freq: c_double,
    args: *mut c_char,
}

#[repr(C)]
struct UhdTuneResult {
    clipped_rf_freq: c_double,
    target_rf_freq: c_double,
    actual_rf_freq: c_double,
    target_dsp_freq: c_double,
    actual_dsp_freq: c_double,
}

#[repr(C)]
struct UhdStreamArgs {
    cpu_format: *mut c_char,
    otw_format: *mut c_char,
    args: *mut c_char,
    channel_list: *mut usize,
    n_channels: c_int,
}

#[repr(C)]
struct UhdStreamCmd {
    stream_mode: c_int,
    num_samps: usize,
    stream_now: bool,
    time_spec_full_secs: i64,
    time_spec_frac_secs: c_double,
}

extern "C" {
    // String vector
    fn uhd_string_vector_make(h: *mut UhdStringVectorHandle) -> UhdError;
    fn uhd_string_vector_free(h: *mut UhdStringVectorHandle) -> UhdError;
    fn uhd_string_vector_size(h: UhdStringVectorHandle, size_out: *mut usize) -> UhdError;
    fn uhd_string_vector_at(
        h: UhdStringVectorHandle,
        index: usize,
        value_out: *mut c_char,
        strbuffer_len: usize,
    ) -> UhdError;

    // Subdevice spec
    fn uhd_subdev_spec_make(h: *mut UhdSubdevSpecHandle, markup: *const c_char) -> UhdError;
    fn uhd_subdev_spec_free(h: *mut UhdSubdevSpecHandle) -> UhdError;

    // USRP
    fn uhd_usrp_make(h: *mut UhdUsrpHandle, args: *const c_char) -> UhdError;
    fn uhd_usrp_free(h: *mut UhdUsrpHandle) -> UhdError;
    fn uhd_usrp_set_rx_rate(h: UhdUsrpHandle, rate: c_double, chan: usize) -> UhdError;
    fn uhd_usrp_get_rx_rate(h: UhdUsrpHandle, chan: usize, rate_out: *mut c_double) -> UhdError;
    fn uhd_usrp_set_tx_rate(h: UhdUsrpHandle, rate: c_double, chan: usize) -> UhdError;
    fn uhd_usrp_get_tx_rate(h: UhdUsrpHandle, chan: usize, rate_out: *mut c_double) -> UhdError;
    fn uhd_usrp_set_rx_gain(
        h: UhdUsrpHandle,
        gain: c_double,
        chan: usize,
        gain_name: *const c_char,
    ) -> UhdError;
    fn uhd_usrp_set_tx_gain(
        h: UhdUsrpHandle,
        gain: c_double,
        chan: usize,
        gain_name: *const c_char,
    ) -> UhdError;
    fn uhd_usrp_set_rx_antenna(h: UhdUsrpHandle, ant: *const c_char, chan: usize) -> UhdError;
    fn uhd_usrp_set_tx_antenna(h: UhdUsrpHandle, ant: *const c_char, chan: usize) -> UhdError;
    fn uhd_usrp_set_rx_freq(
        h: UhdUsrpHandle,
        tune_request: *mut UhdTuneRequest,
        chan: usize,
        tune_result: *mut UhdTuneResult,
    ) -> UhdError;
    fn uhd_usrp_set_tx_freq(
        h: UhdUsrpHandle,
        tune_request: *mut UhdTuneRequest,
        chan: usize,
        tune_result: *mut UhdTuneResult,
    ) -> UhdError;
    fn uhd_usrp_set_rx_subdev_spec(
        h: UhdUsrpHandle,
        subdev_spec: UhdSubdevSpecHandle,
        mboard: usize,
    ) -> UhdError;
    fn uhd_usrp_set_tx_subdev_spec(
        h: UhdUsrpHandle,
        subdev_spec: UhdSubdevSpecHandle,
        mboard: usize,
    ) -> UhdError;
    fn uhd_usrp_get_rx_stream(
        h: UhdUsrpHandle,
        stream_args: *mut UhdStreamArgs,
        h_out: UhdRxStreamerHandle,
    ) -> UhdError;
    fn uhd_usrp_get_tx_stream(
        h: UhdUsrpHandle,
        stream_args: *mut UhdStreamArgs,
        h_out: UhdTxStreamerHandle,
    ) -> UhdError;
    fn uhd_usrp_get_time_now(
        h: UhdUsrpHandle,
        mboard: usize,
        full_secs_out: *mut i64,
        frac_secs_out: *mut c_double,
    ) -> UhdError;
    fn uhd_usrp_set_command_time(
        h: UhdUsrpHandle,
        full_secs: i64,
        frac_secs: c_double,
        mboard: usize,
    ) -> UhdError;
    fn uhd_usrp_get_time_sources(
        h: UhdUsrpHandle,
        mboard: usize,
        time_sources_out: *mut UhdStringVectorHandle,
    ) -> UhdError;

    // RX Streamer
    fn uhd_rx_streamer_make(h: *mut UhdRxStreamerHandle) -> UhdError;
    fn uhd_rx_streamer_free(h: *mut UhdRxStreamerHandle) -> UhdError;
    fn uhd_rx_streamer_recv(
        h: UhdRxStreamerHandle,
        buffs: *mut *mut c_void,
        samps_per_buff: usize,
        md: *mut UhdRxMetadataHandle,
        timeout: c_double,
        one_packet: bool,
        items_recvd: *mut usize,
    ) -> UhdError;
    fn uhd_rx_streamer_issue_stream_cmd(
        h: UhdRxStreamerHandle,
        stream_cmd: *const UhdStreamCmd,
    ) -> UhdError;

    // TX Streamer
    fn uhd_tx_streamer_make(h: *mut UhdTxStreamerHandle) -> UhdError;
    fn uhd_tx_streamer_free(h: *mut UhdTxStreamerHandle) -> UhdError;
    fn uhd_tx_streamer_max_num_samps(
        h: UhdTxStreamerHandle,
        max_num_samps_out: *mut usize,
    ) -> UhdError;
    fn uhd_tx_streamer_send(
        h: UhdTxStreamerHandle,
        buffs: *mut *const c_void,
        samps_per_buff: usize,
        md: *mut UhdTxMetadataHandle,
        timeout: c_double,
        items_sent: *mut usize,
    ) -> UhdError;

    // RX Metadata
    fn uhd_rx_metadata_make(handle: *mut UhdRxMetadataHandle) -> UhdError;
    fn uhd_rx_metadata_free(handle: *mut UhdRxMetadataHandle) -> UhdError;
    fn uhd_rx_metadata_error_code(
        h: UhdRxMetadataHandle,
        error_code_out: *mut c_int,
    ) -> UhdError;
    fn uhd_rx_metadata_time_spec(
        h: UhdRxMetadataHandle,
        full_secs_out: *mut i64,
        frac_secs_out: *mut c_double,
    ) -> UhdError;

    // TX Metadata
    fn uhd_tx_metadata_make(
        handle: *mut UhdTxMetadataHandle,
        has_time_spec: bool,
        full_secs: i64,
        frac_secs: c_double,
        start_of_burst: bool,
        end_of_burst: bool,
    ) -> UhdError;
    fn uhd_tx_metadata_free(handle: *mut UhdTxMetadataHandle) -> UhdError;
}

fn auto_tune_request(target_freq: f64) -> UhdTuneRequest {
    UhdTuneRequest {
        target_freq,
        rf_freq_policy: UHD_TUNE_REQUEST_POLICY_AUTO,
        rf_freq: 0.0,
        dsp_freq_policy: UHD_TUNE_REQUEST_POLICY_AUTO,
        dsp_freq: 0.0,
        args: ptr::null_mut(),
    }
}

fn empty_tune_result() -> UhdTuneResult {
    UhdTuneResult {
        clipped_rf_freq: 0.0,
        target_rf_freq: 0.0,
        actual_rf_freq: 0.0,
        target_dsp_freq: 0.0,
        actual_dsp_freq: 0.0,
    }
}

/// USRP interrogator using the UHD C API: a timed TX burst streamer for
/// the activation pulse and a timed RX gather for the reply.
pub struct UsrpInterrogator {
    usrp: UhdUsrpHandle,
    tx_stream: UhdTxStreamerHandle,
    rx_stream: UhdRxStreamerHandle,
    rx_md: UhdRxMetadataHandle,
    /// Activation pulse, pre-synthesized at the TX offset.
    tx_buf: Vec<Complex32>,
    activation_len_us: u64,
}

impl UsrpInterrogator {
    /// Open the device, configure both front ends, build the streamers
    /// and synthesize the activation pulse.
    pub fn open(config: &RadioConfig) -> Result<Self, String> {
        let dev_args = CString::new(config.device.as_str())
            .map_err(|e| format!("invalid device string: {}", e))?;
        let empty = CString::new("").unwrap();

        unsafe {
            let mut usrp: UhdUsrpHandle = ptr::null_mut();
            let err = uhd_usrp_make(&mut usrp, dev_args.as_ptr());
            if err != UHD_ERROR_NONE {
                return Err(format!("uhd_usrp_make failed: error {}", err));
            }

            // Sample rates. The device may round; log what we got.
            uhd_usrp_set_tx_rate(usrp, config.sample_rate as f64, 0);
            uhd_usrp_set_rx_rate(usrp, config.sample_rate as f64, 0);
            let mut tx_rate: f64 = 0.0;
            let mut rx_rate: f64 = 0.0;
            uhd_usrp_get_tx_rate(usrp, 0, &mut tx_rate);
            uhd_usrp_get_rx_rate(usrp, 0, &mut rx_rate);
            log::info!(
                "requested {:.3} Msps, got TX {:.3} Msps / RX {:.3} Msps",
                config.sample_rate as f64 / 1e6,
                tx_rate / 1e6,
                rx_rate / 1e6,
            );

            // Front-end routing and state.
            let tx_center = config.center_freq as f64 + TX_TUNE_OFFSET_HZ;
            if let Err(e) = Self::setup_frontends(usrp, config, tx_center, &empty) {
                uhd_usrp_free(&mut usrp);
                return Err(e);
            }

            // RX streams full-precision complex doubles straight into the
            // decoder's interval buffer.
            let mut rx_stream: UhdRxStreamerHandle = ptr::null_mut();
            uhd_rx_streamer_make(&mut rx_stream);
            let mut rx_md: UhdRxMetadataHandle = ptr::null_mut();
            uhd_rx_metadata_make(&mut rx_md);

            let rx_fmt = CString::new("fc64").unwrap();
            let mut channel: usize = 0;
            let mut rx_args = UhdStreamArgs {
                cpu_format: rx_fmt.as_ptr() as *mut c_char,
                otw_format: empty.as_ptr() as *mut c_char,
                args: empty.as_ptr() as *mut c_char,
                channel_list: &mut channel,
                n_channels: 1,
            };
            let err = uhd_usrp_get_rx_stream(usrp, &mut rx_args, rx_stream);
            if err != UHD_ERROR_NONE {
                uhd_rx_metadata_free(&mut rx_md);
                uhd_rx_streamer_free(&mut rx_stream);
                uhd_usrp_free(&mut usrp);
                return Err(format!("uhd_usrp_get_rx_stream failed: error {}", err));
            }

            let mut tx_stream: UhdTxStreamerHandle = ptr::null_mut();
            uhd_tx_streamer_make(&mut tx_stream);
            let tx_fmt = CString::new("fc32").unwrap();
            let mut tx_channel: usize = 0;
            let mut tx_args = UhdStreamArgs {
                cpu_format: tx_fmt.as_ptr() as *mut c_char,
                otw_format: empty.as_ptr() as *mut c_char,
                args: empty.as_ptr() as *mut c_char,
                channel_list: &mut tx_channel,
                n_channels: 1,
            };
            let err = uhd_usrp_get_tx_stream(usrp, &mut tx_args, tx_stream);
            if err != UHD_ERROR_NONE {
                uhd_tx_streamer_free(&mut tx_stream);
                uhd_rx_metadata_free(&mut rx_md);
                uhd_rx_streamer_free(&mut rx_stream);
                uhd_usrp_free(&mut usrp);
                return Err(format!("uhd_usrp_get_tx_stream failed: error {}", err));
            }

            // Frequency-shifted sinusoid for the activation pulse, kept
            // below the TX LO so its spur stays out of the RX band.
            let pulse_samps =
                (us_to_sec(config.activation_len_us as f64) * tx_rate) as usize;
            log::info!("pulse is {} samples long", pulse_samps);

            let mut max_burst: usize = 0;
            uhd_tx_streamer_max_num_samps(tx_stream, &mut max_burst);
            if pulse_samps < 2 || pulse_samps > max_burst {
                uhd_tx_streamer_free(&mut tx_stream);
                uhd_rx_metadata_free(&mut rx_md);
                uhd_rx_streamer_free(&mut rx_stream);
                uhd_usrp_free(&mut usrp);
                return Err(format!(
                    "pulse of {} samples does not fit a TX burst of at most {}",
                    pulse_samps, max_burst
                ));
            }

            let time_delta =
                us_to_sec(config.activation_len_us as f64) / (pulse_samps - 1) as f64;
            let tx_buf: Vec<Complex32> = (0..pulse_samps)
                .map(|i| {
                    let theta = -2.0 * std::f64::consts::PI
                        * TX_TUNE_OFFSET_HZ
                        * i as f64
                        * time_delta;
                    Complex32::new(0.9, 0.9) * Complex32::from_polar(1.0, theta as f32)
                })
                .collect();

            if config.use_gps_pps {
                Self::log_time_sources(usrp);
            }

            Ok(Self {
                usrp,
                tx_stream,
                rx_stream,
                rx_md,
                tx_buf,
                activation_len_us: config.activation_len_us,
            })
        }
    }

    unsafe fn setup_frontends(
        usrp: UhdUsrpHandle,
        config: &RadioConfig,
        tx_center: f64,
        empty: &CString,
    ) -> Result<(), String> {
        let tx_port = CString::new(config.tx_port.as_str())
            .map_err(|e| format!("invalid TX port: {}", e))?;
        let rx_port = CString::new(config.rx_port.as_str())
            .map_err(|e| format!("invalid RX port: {}", e))?;
        let tx_ant = CString::new(config.tx_ant.as_str())
            .map_err(|e| format!("invalid TX antenna: {}", e))?;
        let rx_ant = CString::new(config.rx_ant.as_str())
            .map_err(|e| format!("invalid RX antenna: {}", e))?;

        let mut spec: UhdSubdevSpecHandle = ptr::null_mut();
        let err = uhd_subdev_spec_make(&mut spec, tx_port.as_ptr());
        if err != UHD_ERROR_NONE {
            return Err(format!("invalid TX subdevice spec '{}': error {}", config.tx_port, err));
        }
        uhd_usrp_set_tx_subdev_spec(usrp, spec, 0);
        uhd_subdev_spec_free(&mut spec);

        let err = uhd_subdev_spec_make(&mut spec, rx_port.as_ptr());
        if err != UHD_ERROR_NONE {
            return Err(format!("invalid RX subdevice spec '{}': error {}", config.rx_port, err));
        }
        uhd_usrp_set_rx_subdev_spec(usrp, spec, 0);
        uhd_subdev_spec_free(&mut spec);

        let err = uhd_usrp_set_tx_antenna(usrp, tx_ant.as_ptr(), 0);
        if err != UHD_ERROR_NONE {
            return Err(format!("uhd_usrp_set_tx_antenna('{}') failed: error {}", config.tx_ant, err));
        }
        let err = uhd_usrp_set_rx_antenna(usrp, rx_ant.as_ptr(), 0);
        if err != UHD_ERROR_NONE {
            return Err(format!("uhd_usrp_set_rx_antenna('{}') failed: error {}", config.rx_ant, err));
        }

        uhd_usrp_set_tx_gain(usrp, config.tx_gain, 0, empty.as_ptr());
        uhd_usrp_set_rx_gain(usrp, config.rx_gain, 0, empty.as_ptr());

        let mut tune_req = auto_tune_request(tx_center);
        let mut tune_result = empty_tune_result();
        let err = uhd_usrp_set_tx_freq(usrp, &mut tune_req, 0, &mut tune_result);
        if err != UHD_ERROR_NONE {
            return Err(format!("uhd_usrp_set_tx_freq failed: error {}", err));
        }
        log::info!(
            "TX tuned: RF = {:.1} MHz, DSP = {:.1} kHz",
            tune_result.actual_rf_freq / 1e6,
            tune_result.actual_dsp_freq / 1e3,
        );

        let mut tune_req = auto_tune_request(config.center_freq as f64);
        let mut tune_result = empty_tune_result();
        let err = uhd_usrp_set_rx_freq(usrp, &mut tune_req, 0, &mut tune_result);
        if err != UHD_ERROR_NONE {
            return Err(format!("uhd_usrp_set_rx_freq failed: error {}", err));
        }
        log::info!(
            "RX tuned: RF = {:.1} MHz, DSP = {:.1} kHz",
            tune_result.actual_rf_freq / 1e6,
            tune_result.actual_dsp_freq / 1e3,
        );

        Ok(())
    }

    unsafe fn log_time_sources(usrp: UhdUsrpHandle) {
        let mut sv: UhdStringVectorHandle = ptr::null_mut();
        if uhd_string_vector_make(&mut sv) != UHD_ERROR_NONE {
            return;
        }

        if uhd_usrp_get_time_sources(usrp, 0, &mut sv) == UHD_ERROR_NONE {
            let mut count: usize = 0;
            uhd_string_vector_size(sv, &mut count);

            let mut buf = vec![0u8; 256];
            for i in 0..count {
                uhd_string_vector_at(sv, i, buf.as_mut_ptr() as *mut c_char, buf.len());
                let name = std::ffi::CStr::from_ptr(buf.as_ptr() as *const c_char)
                    .to_string_lossy()
                    .to_string();
                log::info!("time source: {}", name);
            }
        }
        uhd_string_vector_free(&mut sv);

        let mut full: i64 = 0;
        let mut frac: f64 = 0.0;
        if uhd_usrp_get_time_now(usrp, 0, &mut full, &mut frac) == UHD_ERROR_NONE {
            log::info!("device time is {:.6}", full as f64 + frac);
        }
    }
}

impl Interrogator for UsrpInterrogator {
    fn arm_and_fire(&mut self, target: &mut [Complex64], spacing_us: u64) -> Result<u64, String> {
        let num_samps = target.len();

        unsafe {
            let mut full: i64 = 0;
            let mut frac: f64 = 0.0;
            let err = uhd_usrp_get_time_now(self.usrp, 0, &mut full, &mut frac);
            if err != UHD_ERROR_NONE {
                return Err(format!("uhd_usrp_get_time_now failed: error {}", err));
            }
            let now = full as f64 + frac;

            // Queue the timed commands with lead to spare.
            let cmd_time = now + us_to_sec(spacing_us as f64 - COMMAND_LEAD_US);
            uhd_usrp_set_command_time(self.usrp, cmd_time.trunc() as i64, cmd_time.fract(), 0);

            // One pulse-length burst at the requested spacing.
            let fire_time = now + us_to_sec(spacing_us as f64);
            let mut tx_md: UhdTxMetadataHandle = ptr::null_mut();
            let err = uhd_tx_metadata_make(
                &mut tx_md,
                true,
                fire_time.trunc() as i64,
                fire_time.fract(),
                true,
                true,
            );
            if err != UHD_ERROR_NONE {
                return Err(format!("uhd_tx_metadata_make failed: error {}", err));
            }

            // The gather starts once the pulse has ended and the
            // transponder has had time to wake and turn around.
            let rx_time = fire_time
                + us_to_sec(self.activation_len_us as f64)
                + us_to_sec(RX_TURNAROUND_US);
            let rx_cmd = UhdStreamCmd {
                stream_mode: UHD_STREAM_MODE_NUM_SAMPS_AND_DONE,
                num_samps,
                stream_now: false,
                time_spec_full_secs: rx_time.trunc() as i64,
                time_spec_frac_secs: rx_time.fract(),
            };
            let err = uhd_rx_streamer_issue_stream_cmd(self.rx_stream, &rx_cmd);
            if err != UHD_ERROR_NONE {
                uhd_tx_metadata_free(&mut tx_md);
                return Err(format!("uhd_rx_streamer_issue_stream_cmd failed: error {}", err));
            }

            // Send the burst.
            let mut tx_buff: *const c_void = self.tx_buf.as_ptr() as *const c_void;
            let mut sent: usize = 0;
            let err = uhd_tx_streamer_send(
                self.tx_stream,
                &mut tx_buff,
                self.tx_buf.len(),
                &mut tx_md,
                1.0,
                &mut sent,
            );
            uhd_tx_metadata_free(&mut tx_md);
            if err != UHD_ERROR_NONE {
                return Err(format!("uhd_tx_streamer_send failed: error {}", err));
            }
            if sent < self.tx_buf.len() {
                return Err(format!(
                    "transmitted {} of {} pulse samples, aborting",
                    sent,
                    self.tx_buf.len()
                ));
            }

            // Collect the reply into the caller's interval buffer.
            let mut rx_buff = target.as_mut_ptr() as *mut c_void;
            let mut received: usize = 0;
            let err = uhd_rx_streamer_recv(
                self.rx_stream,
                &mut rx_buff,
                num_samps,
                &mut self.rx_md,
                1.0,
                false,
                &mut received,
            );
            if err != UHD_ERROR_NONE {
                return Err(format!("uhd_rx_streamer_recv failed: error {}", err));
            }
            if received < num_samps {
                return Err(format!(
                    "received {} of {} samples, aborting",
                    received, num_samps
                ));
            }

            let mut error_code: c_int = 0;
            uhd_rx_metadata_error_code(self.rx_md, &mut error_code);
            if error_code != UHD_RX_METADATA_ERROR_CODE_NONE {
                return Err(format!("receive stream error: {}", error_code));
            }

            let mut rx_full: i64 = 0;
            let mut rx_frac: f64 = 0.0;
            uhd_rx_metadata_time_spec(self.rx_md, &mut rx_full, &mut rx_frac);

            Ok(((rx_full as f64 + rx_frac) * 1e6) as u64)
        }
    }
}

impl Drop for UsrpInterrogator {
    fn drop(&mut self) {
        unsafe {
            uhd_tx_streamer_free(&mut self.tx_stream);
            uhd_rx_metadata_free(&mut self.rx_md);
            uhd_rx_streamer_free(&mut self.rx_stream);
            uhd_usrp_free(&mut self.usrp);
        }
    }
}
