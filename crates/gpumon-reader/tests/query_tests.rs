use std::io::Write;

use chrono::NaiveDate;
use gpumon_common::{Field, GpumonError};
use gpumon_reader::{parse_query_xml, DeviceReader, RawBatch, SmiQueryReader, ToolCommand};

const SAMPLE: &str = r#"<?xml version="1.0" ?>
<!DOCTYPE nvidia_smi_log SYSTEM "nvsmi_device_v12.dtd">
<nvidia_smi_log>
    <timestamp>Sat Apr  1 10:00:00 2023</timestamp>
    <driver_version>535.154.05</driver_version>
    <attached_gpus>2</attached_gpus>
    <gpu id="00000000:01:00.0">
        <product_name>NVIDIA A100-SXM4-40GB</product_name>
        <fb_memory_usage>
            <total>40960 MiB</total>
            <used>10240 MiB</used>
            <free>30720 MiB</free>
        </fb_memory_usage>
        <utilization>
            <gpu_util>10 %</gpu_util>
            <memory_util>5 %</memory_util>
            <encoder_util>0 %</encoder_util>
            <decoder_util>0 %</decoder_util>
        </utilization>
        <temperature>
            <gpu_temp>45 C</gpu_temp>
        </temperature>
        <power_readings>
            <power_draw>30.12 W</power_draw>
        </power_readings>
        <clocks>
            <graphics_clock>1200 MHz</graphics_clock>
            <mem_clock>300 MHz</mem_clock>
        </clocks>
    </gpu>
    <gpu id="00000000:02:00.0">
        <product_name>NVIDIA GeForce GTX 1080</product_name>
        <utilization>
            <gpu_util>77 %</gpu_util>
            <memory_util>N/A</memory_util>
        </utilization>
        <temperature>
            <gpu_temp>61 C</gpu_temp>
        </temperature>
        <gpu_power_readings>
            <power_draw>120.00 W</power_draw>
        </gpu_power_readings>
    </gpu>
</nvidia_smi_log>
"#;

fn at() -> chrono::DateTime<chrono::Utc> {
    NaiveDate::from_ymd_opt(2023, 4, 1).unwrap().and_hms_opt(10, 0, 0).unwrap().and_utc()
}

#[test]
fn extended_query_extracts_all_reported_fields() {
    let gpus = parse_query_xml(SAMPLE, true, at()).unwrap();
    assert_eq!(gpus.len(), 2);

    let a100 = &gpus[0];
    assert_eq!(a100.device_id(), 0);
    assert_eq!(a100.device_name(), Some("NVIDIA A100-SXM4-40GB"));
    assert_eq!(a100.get(Field::Temperature), Some(45.0));
    assert_eq!(a100.get(Field::SmUtil), Some(10.0));
    assert_eq!(a100.get(Field::MemUtil), Some(5.0));
    assert_eq!(a100.get(Field::Power), Some(30.12));
    assert_eq!(a100.get(Field::MemUsed), Some(25.0));
    assert_eq!(a100.get(Field::GraphicsClock), Some(1200.0));
    assert_eq!(a100.get(Field::MemClock), Some(300.0));

    let gtx = &gpus[1];
    assert_eq!(gtx.device_id(), 1);
    assert_eq!(gtx.get(Field::MemUtil), None);
    assert_eq!(gtx.get(Field::Power), Some(120.0));
    assert_eq!(gtx.get(Field::MemUsed), None);
}

#[test]
fn basic_query_keeps_temperature_and_utilization_only() {
    let gpus = parse_query_xml(SAMPLE, false, at()).unwrap();
    let fields: Vec<Field> = gpus[0].present().map(|(f, _)| f).collect();
    assert_eq!(fields, vec![Field::Temperature, Field::SmUtil]);
}

#[test]
fn malformed_xml_is_a_rejection() {
    assert!(matches!(parse_query_xml("<nvidia_smi_log><gpu>", true, at()), Err(GpumonError::ParseRejected(_))));
    assert!(matches!(parse_query_xml("<other/>", true, at()), Err(GpumonError::ParseRejected(_))));
}

#[tokio::test]
async fn reader_runs_the_tool_each_poll() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(SAMPLE.as_bytes()).unwrap();
    let mut reader = SmiQueryReader::with_command(ToolCommand::new("cat", [file.path()]), true);

    reader.open().await.unwrap();
    let RawBatch::Records(gpus) = reader.poll_once().await.unwrap() else { panic!("expected records") };
    assert_eq!(gpus.len(), 2);

    let devices = reader.describe().await.unwrap();
    assert_eq!(devices[1].name.as_deref(), Some("NVIDIA GeForce GTX 1080"));
}

#[tokio::test]
async fn missing_tool_is_device_unavailable() {
    let mut reader = SmiQueryReader::new("/nonexistent/nvidia-smi", true);
    let err = reader.open().await.unwrap_err();
    assert!(matches!(err, GpumonError::DeviceUnavailable(_)));
    assert!(err.is_fatal());
}
