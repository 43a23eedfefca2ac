/// Application constants

// API version
pub const API_VERSION: &str = "v1";

// Wire protocol
pub const DEFAULT_ADJUSTMENT_COMMAND: &str = "balance_adj";
pub const WIRE_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
pub const STATUS_OK: &str = "1";
pub const STATUS_REJECTED: &str = "0";
pub const DUPLICATE_TRANSACTION_MESSAGE: &str = "Duplicate transaction";
pub const INSUFFICIENT_FUNDS_MESSAGE: &str = "Insufficient funds";

// Request validation
pub const DEFAULT_TIMESTAMP_WINDOW_SECS: i64 = 300;
pub const DEFAULT_LOGIN_PREFIXES: &str = "casino_live_,casino_,cl_";

// Balance accounting
pub const DEFAULT_MINOR_UNITS_PER_COIN: i64 = 1_000_000_000; // lamports per SOL
pub const MAX_COMMIT_ATTEMPTS: usize = 5;

// Price oracle
pub const DEFAULT_LOCAL_PRICE_TTL_SECS: u64 = 30;
pub const DEFAULT_SHARED_PRICE_TTL_SECS: u64 = 65;
pub const DEFAULT_PROVIDER_TIMEOUT_MS: u64 = 1_500;
pub const TEST_LOCK_REFRESH_SECS: u64 = 5;
pub const MAX_TEST_LOCK_SECS: u64 = 86_400;
pub const DEFAULT_MIN_RATE: &str = "1";
pub const DEFAULT_MAX_RATE: &str = "10000";

// Price providers
pub const PROVIDER_COINGECKO: &str = "CoinGecko";
pub const PROVIDER_BINANCE: &str = "Binance";
pub const PROVIDER_KRAKEN: &str = "Kraken";
pub const DEFAULT_COINGECKO_URL: &str =
    "https://api.coingecko.com/api/v3/simple/price?ids=solana&vs_currencies=usd";
pub const DEFAULT_BINANCE_URL: &str = "https://api.binance.com/api/v3/ticker/price?symbol=SOLUSDT";
pub const DEFAULT_KRAKEN_URL: &str = "https://api.kraken.com/0/public/Ticker?pair=SOLUSD";

// Ephemeral records
pub const DEFAULT_IDEMPOTENCY_TTL_SECS: u64 = 3_600;
pub const DEFAULT_PENDING_BET_TTL_SECS: u64 = 21_600;

// External call budgets
pub const STORE_TIMEOUT_MS: u64 = 750;
pub const DATABASE_TIMEOUT_MS: u64 = 2_000;

// Job dispatch
pub const DEFAULT_JOB_STREAM: &str = "ledger:balance_jobs";
pub const DEFAULT_JOB_STREAM_MAX_LEN: usize = 100_000;
pub const DEFAULT_JOB_QUEUE_CAPACITY: usize = 4_096;
pub const JOB_DRAIN_TIMEOUT_SECS: u64 = 10;
