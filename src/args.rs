use clap::{Args, Parser, Subcommand, ValueEnum};
use trade_export_core::{JobKind, QueryFilter};

/// Preview and download trade datasets as spreadsheets
#[derive(Parser, Debug)]
#[command(name = "trade-export")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Query service URL (overrides TRADE_EXPORT_BASE_URL)
    #[arg(short = 'u', long = "url")]
    pub url: Option<String>,

    /// Database server name
    #[arg(long = "server")]
    pub server: Option<String>,

    /// Database name
    #[arg(long = "database")]
    pub database: Option<String>,

    /// Database login
    #[arg(long = "username")]
    pub username: Option<String>,

    /// Database password
    #[arg(long = "password")]
    pub password: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Show matched/total counts and a sample of rows
    Preview {
        #[arg(value_enum)]
        kind: KindArg,

        #[command(flatten)]
        filter: FilterArgs,
    },
    /// Generate and download the full spreadsheet
    Generate {
        #[arg(value_enum)]
        kind: KindArg,

        #[command(flatten)]
        filter: FilterArgs,

        /// Accept a truncated file without asking when the row limit is exceeded
        #[arg(short = 'y', long = "yes")]
        yes: bool,

        /// Send the row-limit override with the first request
        #[arg(long = "force")]
        force: bool,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum KindArg {
    Export,
    Import,
}

impl From<KindArg> for JobKind {
    fn from(value: KindArg) -> Self {
        match value {
            KindArg::Export => JobKind::Export,
            KindArg::Import => JobKind::Import,
        }
    }
}

#[derive(Args, Debug, Clone, Default)]
pub struct FilterArgs {
    /// First month, YYYYMM
    #[arg(long = "from")]
    pub from_month: Option<u32>,

    /// Last month, YYYYMM
    #[arg(long = "to")]
    pub to_month: Option<u32>,

    #[arg(long = "hs-code")]
    pub hs_code: Option<String>,

    #[arg(long = "company")]
    pub company: Option<String>,

    #[arg(long = "port")]
    pub port: Option<String>,

    #[arg(long = "country")]
    pub country: Option<String>,

    #[arg(long = "product")]
    pub product: Option<String>,
}

impl From<FilterArgs> for QueryFilter {
    fn from(args: FilterArgs) -> Self {
        QueryFilter {
            from_month: args.from_month,
            to_month: args.to_month,
            hs_code: args.hs_code,
            company: args.company,
            port: args.port,
            country: args.country,
            product: args.product,
        }
    }
}
