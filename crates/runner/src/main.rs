//! Grid trading runner.
//!
//! This is the main entry point for the engine. It:
//! - Builds a paper-trading exchange with one simulated product
//! - Constructs a wall of buy/sell loops over the configured price band
//! - Persists and runs the wall as a supervised job
//! - Feeds the sim with a random-walk ticker
//! - Handles graceful shutdown on Ctrl+C and prints a trade summary
//!
//! Real exchange adapters plug in through the same `Product`/`Exchange`
//! traits the sim implements.
//!
//! # Usage
//!
//! ```bash
//! cargo run --release -- --low 100 --high 120 --step 10 --size 1
//! ```

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use exchange_core::{Exchange, SimExchange, SimProduct};
use kv_core::{KvError, MemoryDatabase};
use model::{Point, Ticker};
use rand::Rng;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tokio::sync::watch;
use tracing::{error, info};
use trader_core::{
    summarize, ExchangeMap, JobSet, PairRecord, Runtime, Status, Waller, WALLERS_KEYSPACE,
};
use uuid::Uuid;

/// Cadence of the simulated ticker feed.
const FEED_INTERVAL: Duration = Duration::from_millis(100);

struct Options {
    product_id: String,
    low: Decimal,
    high: Decimal,
    step: Decimal,
    size: Decimal,
    fee_pct: Decimal,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            product_id: "SIM-USD".to_string(),
            low: dec!(100),
            high: dec!(120),
            step: dec!(10),
            size: dec!(1),
            fee_pct: dec!(0.25),
        }
    }
}

fn print_usage() {
    eprintln!("Usage: gridbot [OPTIONS]");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  --product <id>   Simulated product id (default SIM-USD)");
    eprintln!("  --low <price>    Bottom of the price band (default 100)");
    eprintln!("  --high <price>   Top of the price band (default 120)");
    eprintln!("  --step <width>   Width of one buy/sell loop (default 10)");
    eprintln!("  --size <size>    Base size per loop (default 1)");
    eprintln!("  --fee <pct>      Sim fee percentage per fill (default 0.25)");
    eprintln!("  --help           Show this help message");
}

fn parse_decimal(flag: &str, value: Option<String>) -> Decimal {
    let Some(value) = value else {
        eprintln!("{flag} requires a value");
        std::process::exit(1);
    };
    match Decimal::from_str(&value) {
        Ok(d) => d,
        Err(err) => {
            eprintln!("invalid value {value:?} for {flag}: {err}");
            std::process::exit(1);
        }
    }
}

fn parse_args() -> Options {
    let mut options = Options::default();
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--product" => {
                options.product_id = args.next().unwrap_or_else(|| {
                    eprintln!("--product requires a value");
                    std::process::exit(1);
                });
            }
            "--low" => options.low = parse_decimal("--low", args.next()),
            "--high" => options.high = parse_decimal("--high", args.next()),
            "--step" => options.step = parse_decimal("--step", args.next()),
            "--size" => options.size = parse_decimal("--size", args.next()),
            "--fee" => options.fee_pct = parse_decimal("--fee", args.next()),
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            other => {
                eprintln!("Unknown option: {other}");
                print_usage();
                std::process::exit(1);
            }
        }
    }
    if options.low <= Decimal::ZERO
        || options.high <= options.low
        || options.step <= Decimal::ZERO
    {
        eprintln!("price band must satisfy 0 < low < high with a positive step");
        std::process::exit(1);
    }
    options
}

/// Adjacent buy/sell pairs covering [low, high] in steps of `step`. Each
/// loop buys at the bottom of its slice and sells at the top, with the
/// cancel threshold at the midpoint.
fn build_pairs(options: &Options) -> Vec<PairRecord> {
    let mut pairs = Vec::new();
    let mut price = options.low;
    while price + options.step <= options.high {
        let mid = price + options.step / Decimal::TWO;
        pairs.push(PairRecord {
            buy: Point {
                size: options.size,
                price,
                cancel: mid,
            },
            sell: Point {
                size: options.size,
                price: price + options.step,
                cancel: mid,
            },
        });
        price += options.step;
    }
    pairs
}

/// Publish a random-walk ticker into the sim until shutdown.
async fn run_feed(
    product: Arc<SimProduct>,
    low: Decimal,
    high: Decimal,
    step: Decimal,
    mut shutdown: watch::Receiver<bool>,
) {
    let band = high - low;
    let floor = low - band / Decimal::TEN;
    let ceiling = high + band / Decimal::TEN;
    let tick = step / Decimal::TEN;

    let mut price = (low + high) / Decimal::TWO;
    let mut interval = tokio::time::interval(FEED_INTERVAL);
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
            _ = interval.tick() => {
                let steps: i64 = rand::thread_rng().gen_range(-2..=2);
                price += tick * Decimal::from(steps);
                price = price.clamp(floor, ceiling);
                product.publish_ticker(Ticker::new(price, Utc::now()));
            }
        }
    }
}

#[tokio::main]
async fn main() {
    // Load .env if present, then logging.
    let _ = dotenvy::dotenv();
    common::init_logging();

    let options = parse_args();
    let pairs = build_pairs(&options);
    if pairs.is_empty() {
        eprintln!("price band is narrower than one step; nothing to run");
        std::process::exit(1);
    }

    // Paper exchange, product and database.
    let product = Arc::new(SimProduct::new(
        options.product_id.as_str(),
        dec!(0.001),
        options.fee_pct / Decimal::ONE_HUNDRED,
    ));
    let exchange = Arc::new(SimExchange::new("sim"));
    exchange.add_product(product.clone());
    let exchanges = ExchangeMap::new();
    exchanges.register(exchange);
    let database = Arc::new(MemoryDatabase::new());

    let uid = format!("{}{}", WALLERS_KEYSPACE, Uuid::new_v4());
    let mut waller = match Waller::new(&uid, "sim", &options.product_id, &pairs) {
        Ok(waller) => waller,
        Err(err) => {
            error!(error = %err, "could not build the wall");
            std::process::exit(1);
        }
    };

    match waller.plan(options.fee_pct) {
        Ok(plan) => {
            info!(
                budget = %plan.budget().round_dp(2),
                num_pairs = plan.num_pairs(),
                min_profit = %plan.min_profit_margin().round_dp(2),
                max_profit = %plan.max_profit_margin().round_dp(2),
                median_lockin = %plan.median_lockin_amount().round_dp(2),
                "wall plan"
            );
            for apr in [dec!(5), dec!(10), dec!(20)] {
                info!(
                    apr = %apr,
                    sells_per_year = %plan.num_sells_per_year(apr).round_dp(2),
                    "break-even sells"
                );
            }
        }
        Err(err) => {
            error!(error = %err, "could not compute the wall plan");
            std::process::exit(1);
        }
    }

    // Initial checkpoint before the job starts.
    if let Err(err) =
        kv_core::with_read_writer::<_, KvError, _>(database.as_ref(), |rw| waller.save(rw))
    {
        error!(error = %err, "could not save the initial wall state");
        std::process::exit(1);
    }

    let product_handle = match exchanges.get("sim") {
        Ok(exchange) => match exchange.get_product(&options.product_id).await {
            Ok(handle) => handle,
            Err(err) => {
                error!(error = %err, "could not open the product");
                std::process::exit(1);
            }
        },
        Err(err) => {
            error!(error = %err, "could not resolve the exchange");
            std::process::exit(1);
        }
    };
    let runtime = Runtime::new(product_handle, database.clone());

    let jobs = JobSet::new();
    let waller = Arc::new(tokio::sync::Mutex::new(waller));
    let job_waller = waller.clone();
    let job_runtime = runtime.clone();
    let started = jobs.start(&uid, move |shutdown| {
        let waller = job_waller.clone();
        let runtime = job_runtime.clone();
        async move {
            // The per-job lock keeps run/refresh/fix from overlapping.
            let mut waller = waller.lock().await;
            waller.run(&runtime, shutdown).await
        }
    });
    if let Err(err) = started {
        error!(error = %err, "could not start the wall job");
        std::process::exit(1);
    }
    info!(uid = %uid, product_id = %options.product_id, "wall job running; press Ctrl+C to stop");

    // Simulated market data.
    let (feed_tx, feed_rx) = watch::channel(false);
    let feed_product = product.clone();
    let (low, high, step) = (options.low, options.high, options.step);
    let feed = tokio::spawn(async move {
        run_feed(feed_product, low, high, step, feed_rx).await;
    });

    if tokio::signal::ctrl_c().await.is_ok() {
        info!("received Ctrl+C, shutting down");
    }
    let _ = feed_tx.send(true);
    jobs.stop_all().await;
    let _ = feed.await;

    // Final trade summary.
    let waller = waller.lock().await;
    let statuses: Vec<Status> = Status::from_waller(&waller);
    let summary = summarize(&statuses);
    info!(
        num_buys = summary.num_buys,
        num_sells = summary.num_sells,
        profit = %summary.profit().round_dp(4),
        fees = %summary.fees().round_dp(4),
        return_rate = %summary.return_rate().round_dp(4),
        "final summary"
    );

    info!("shutdown complete");
}
