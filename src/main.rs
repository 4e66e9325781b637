//! MMAP Stream - 独占模式低延迟音频流控制器
//!
//! 命令行工具：用模拟设备跑一个完整的独占会话，
//! 打印事件、位置和统计

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};

use mmap_stream::audio::{ChannelMask, Clock, ManualClock, MonotonicClock, StreamRequest};
use mmap_stream::endpoint::EndpointRegistry;
use mmap_stream::hal::{DeviceCapabilities, PortHandle, SimulatedDevice, SimulatedDeviceControl};
use mmap_stream::shm::HeapAllocator;
use mmap_stream::stream::{AudioClient, ClientAttributes, ServiceStream, Usage};
use mmap_stream::{HalError, StandbyStopPolicy, StreamConfig, StreamError, StreamService};

const PORT: PortHandle = PortHandle(0);

/// MMAP Stream - exclusive-mode low-latency stream controller
#[derive(Parser)]
#[command(name = "mmap-stream")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Show verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Show simulated endpoint capabilities
    Info,

    /// Run an exclusive session against a simulated device
    Simulate {
        /// Sample rate in Hz
        #[arg(short, long, default_value = "48000")]
        rate: u32,

        /// Channel count
        #[arg(short, long, default_value = "2")]
        channels: u32,

        /// Buffer capacity in frames
        #[arg(short, long, default_value = "192")]
        frames: u32,

        /// Number of report ticks
        #[arg(short, long, default_value = "100")]
        ticks: u32,

        /// Tick interval in milliseconds
        #[arg(long, default_value = "10")]
        tick_ms: u64,

        /// Minimum report period in microseconds
        #[arg(long, default_value = "1000")]
        min_report_us: u64,

        /// Maximum report period in microseconds
        #[arg(long, default_value = "20000")]
        max_report_us: u64,

        /// Use the system clock and a background reporter thread
        #[arg(long)]
        realtime: bool,

        /// Simulate an endpoint without standby support
        #[arg(long)]
        no_standby: bool,

        /// Allow stop directly from standby
        #[arg(long)]
        allow_standby_stop: bool,

        /// Fail this many position reads halfway through the session
        #[arg(long)]
        fail_reads: Option<u32>,

        /// Lock mailbox memory
        #[arg(long)]
        mlock: bool,
    },
}

/// simulate 子命令参数
struct SimulateArgs {
    rate: u32,
    channels: u32,
    frames: u32,
    ticks: u32,
    tick_ms: u64,
    min_report_us: u64,
    max_report_us: u64,
    realtime: bool,
    no_standby: bool,
    allow_standby_stop: bool,
    fail_reads: Option<u32>,
    mlock: bool,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // 初始化日志
    if cli.verbose {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    } else {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    }

    match cli.command {
        Commands::Info => show_endpoint_info(),
        Commands::Simulate {
            rate,
            channels,
            frames,
            ticks,
            tick_ms,
            min_report_us,
            max_report_us,
            realtime,
            no_standby,
            allow_standby_stop,
            fail_reads,
            mlock,
        } => simulate(SimulateArgs {
            rate,
            channels,
            frames,
            ticks,
            tick_ms,
            min_report_us,
            max_report_us,
            realtime,
            no_standby,
            allow_standby_stop,
            fail_reads,
            mlock,
        }),
    }
}

/// 显示模拟端点能力
fn show_endpoint_info() -> anyhow::Result<()> {
    let caps = DeviceCapabilities::simulated("Simulated MMAP Endpoint");
    let defaults = &caps.default_format;

    println!("=== MMAP Endpoints ===\n");
    println!("[{}] {}", PORT, caps.name);
    println!("  Directions:    {:?}", caps.directions);
    println!("  Sample rates:  {:?}", caps.sample_rates);
    println!("  Max channels:  {}", caps.max_channels);
    println!("  Formats:       {:?}", caps.sample_formats);
    println!(
        "  Buffer:        {}..={} frames (default {})",
        caps.min_buffer_frames, caps.max_buffer_frames, caps.default_buffer_frames
    );
    println!(
        "  Default:       {}Hz {}ch {:?}",
        defaults.sample_rate,
        defaults.channel_count(),
        defaults.sample_format
    );
    println!("  Standby:       {}", if caps.standby_supported { "yes" } else { "no" });

    Ok(())
}

/// 跑一次完整的独占会话
fn simulate(args: SimulateArgs) -> anyhow::Result<()> {
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })?;

    let manual = Arc::new(ManualClock::new(0));
    let clock: Arc<dyn Clock> = if args.realtime {
        Arc::new(MonotonicClock) as Arc<dyn Clock>
    } else {
        manual.clone() as Arc<dyn Clock>
    };

    let mut caps = DeviceCapabilities::simulated("Simulated MMAP Endpoint");
    caps.standby_supported = !args.no_standby;
    let (device, control) = SimulatedDevice::new(PORT, caps, clock.clone());
    let registry = EndpointRegistry::new();
    registry.register(PORT, Box::new(device))?;

    let config = StreamConfig {
        standby_stop_policy: if args.allow_standby_stop {
            StandbyStopPolicy::AllowDirect
        } else {
            StandbyStopPolicy::RequireExitStandby
        },
        min_report_period_ns: args.min_report_us * 1_000,
        max_report_period_ns: args.max_report_us * 1_000,
        initial_report_period_ns: args.min_report_us * 1_000,
        lock_shared_memory: args.mlock,
        ..StreamConfig::default()
    };
    let service = StreamService::new(
        config,
        registry.clone(),
        Arc::new(HeapAllocator::new()),
        clock.clone(),
    )?
    .with_reporters(args.realtime);

    let request = StreamRequest::exclusive_output(
        PORT,
        args.rate,
        ChannelMask::from_count(args.channels),
        args.frames,
    );
    let (handle, descriptor) = service.open_stream(&request)?;
    let stream = service.stream(handle)?;
    let mut reader = stream
        .mailbox_reader()
        .ok_or_else(|| anyhow::anyhow!("stream has no mailbox"))?;

    println!("MMAP Stream - Simulated Session");
    println!(
        "Opened {} ({}): buffer {:#x}, {} frames x {} bytes, burst {}",
        handle,
        stream.type_text(),
        descriptor.data.buffer_id,
        descriptor.data.capacity_frames,
        descriptor.data.bytes_per_frame,
        descriptor.data.burst_frames
    );
    println!(
        "Mailbox: {} slots x {} bytes (gen {})\n",
        descriptor.mailbox.slot_count, descriptor.mailbox.slot_size_bytes, descriptor.generation
    );

    let attributes = ClientAttributes {
        usage: Usage::Game,
        tags: "simulate".into(),
    };
    let client = AudioClient::new(std::process::id(), 0);
    let client_handle = stream.start_client(client, &attributes)?;
    println!("Client {} started -> {}", client.pid, stream.state());

    match stream.start_client(AudioClient::new(client.pid + 1, 1), &attributes) {
        Err(e) => println!("Second client rejected: {} (code {})", e, e.code()),
        Ok(_) => println!("Second client unexpectedly accepted"),
    }
    service.wake_reporter(handle);

    run_ticks(&args, &*stream, &manual, &control, &running);

    let position = stream.get_free_running_position();
    report_position("Position", &position);
    report_position("Hardware", &stream.get_hardware_timestamp());

    step("pause", stream.pause(), &*stream);
    step("standby", stream.standby(), &*stream);
    step("stop (in standby)", stream.stop(), &*stream);
    match stream.exit_standby() {
        Ok(renewed) => println!(
            "{:<20} ok -> {} (descriptor gen {}, buffer {:#x})",
            "exit standby",
            stream.state(),
            renewed.generation,
            renewed.data.buffer_id
        ),
        Err(e) => println!("{:<20} {} (code {})", "exit standby", e, e.code()),
    }
    step("stop client", stream.stop_client(client_handle), &*stream);

    let stats = stream.stats();
    service.close_stream(handle)?;
    println!(
        "Closed -> {}, endpoint granted: {}\n",
        stream.state(),
        registry.is_granted(PORT)
    );

    let events = reader.drain();
    let mut counts: BTreeMap<String, usize> = BTreeMap::new();
    for event in &events {
        *counts.entry(format!("{:?}", event.tag)).or_default() += 1;
    }
    println!("Mailbox events read: {} (dropped {})", events.len(), reader.dropped());
    for (tag, count) in &counts {
        println!("  {:<18} {}", tag, count);
    }
    println!();
    println!("{}", stats);

    Ok(())
}

/// 驱动上报
///
/// 非 realtime 模式下手动推进时钟并直接调用 `report_data`
fn run_ticks(
    args: &SimulateArgs,
    stream: &dyn ServiceStream,
    manual: &ManualClock,
    control: &SimulatedDeviceControl,
    running: &AtomicBool,
) {
    let tick_ns = args.tick_ms * 1_000_000;
    for tick in 0..args.ticks {
        if !running.load(Ordering::SeqCst) {
            println!("\nSession interrupted.");
            break;
        }
        if tick == args.ticks / 2 {
            if let Some(count) = args.fail_reads {
                control.fail_reads(count, HalError::Status(-5));
            }
        }

        if args.realtime {
            std::thread::sleep(Duration::from_millis(args.tick_ms));
        } else {
            manual.advance(tick_ns);
            stream.report_data();
        }
    }
    println!("Ran {} ticks -> {}", args.ticks, stream.state());
}

fn report_position(label: &str, result: &Result<mmap_stream::hal::FramePosition, StreamError>) {
    match result {
        Ok(pos) => println!("{:<20} {} frames @ {} ns", label, pos.frames, pos.time_ns),
        Err(e) => println!("{:<20} {} (code {})", label, e, e.code()),
    }
}

fn step(label: &str, result: Result<(), StreamError>, stream: &dyn ServiceStream) {
    match result {
        Ok(()) => println!("{:<20} ok -> {}", label, stream.state()),
        Err(e) => println!("{:<20} {} (code {})", label, e, e.code()),
    }
}
