//! What a run crawls: the operations to register and the tasks to seed.
//!
//! Process workers rebuild the same registry from the arguments they are
//! started with, so everything here is derived from [`SiteArgs`] alone.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Args, ValueEnum};
use harvest_client::catalogue::{self, BookPage, Catalogue, ListPage};
use harvest_client::{FetcherConfig, ReqwestFetcher};
use harvest_core::chaos::FaultInjector;
use harvest_core::{AppError, Operation, OperationRegistry, Params, Task, TaskContext};

pub const DEMO_LIST_PAGE: &str = "demo.list_page";
pub const DEMO_ITEM: &str = "demo.item";

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Site {
    /// The book catalogue over HTTP.
    Catalogue,
    /// Offline synthetic fan-out.
    Demo,
}

impl Site {
    pub fn as_str(&self) -> &'static str {
        match self {
            Site::Catalogue => "catalogue",
            Site::Demo => "demo",
        }
    }
}

/// Everything needed to build a site's operations.
#[derive(Debug, Clone, Args)]
pub struct SiteArgs {
    /// Catalogue base URL
    #[arg(long, env = "HARVEST_BASE_URL", default_value = catalogue::DEFAULT_BASE_URL)]
    pub base_url: String,

    /// HTTP User-Agent header
    #[arg(long, env = "HARVEST_USER_AGENT")]
    pub user_agent: Option<String>,

    /// HTTP request timeout in seconds
    #[arg(long, env = "HARVEST_TIMEOUT_SECS", default_value_t = 30)]
    pub timeout_secs: u64,

    /// Items each demo listing page fans out into
    #[arg(long, default_value_t = 5)]
    pub items: u32,

    /// Share of task invocations that fail on purpose (0.0 to 1.0)
    #[arg(long, env = "HARVEST_FAULT_RATE", default_value_t = 0.0)]
    pub fault_rate: f64,
}

impl SiteArgs {
    /// Arguments that make a worker process rebuild this configuration.
    pub fn to_worker_args(&self) -> Vec<String> {
        let mut args = vec![
            "--base-url".to_string(),
            self.base_url.clone(),
            "--timeout-secs".to_string(),
            self.timeout_secs.to_string(),
            "--items".to_string(),
            self.items.to_string(),
            "--fault-rate".to_string(),
            self.fault_rate.to_string(),
        ];
        if let Some(user_agent) = &self.user_agent {
            args.push("--user-agent".to_string());
            args.push(user_agent.clone());
        }
        args
    }

    fn catalogue(&self) -> Result<Catalogue<ReqwestFetcher>> {
        let mut config = FetcherConfig::default().with_timeout(Duration::from_secs(self.timeout_secs));
        if let Some(user_agent) = &self.user_agent {
            config = config.with_user_agent(user_agent.clone());
        }
        let fetcher = ReqwestFetcher::with_config(config).context("Failed to create HTTP client")?;
        Catalogue::new(fetcher, &self.base_url).context("Invalid catalogue configuration")
    }
}

pub fn build_registry(site: Site, args: &SiteArgs) -> Result<OperationRegistry> {
    let rate = args.fault_rate;
    let mut registry = OperationRegistry::new();
    match site {
        Site::Catalogue => {
            let catalogue = args.catalogue()?;
            registry
                .register(
                    catalogue::LIST_PAGE,
                    FaultInjector::new(ListPage::new(catalogue.clone()), rate),
                )
                .register(catalogue::BOOK, FaultInjector::new(BookPage::new(catalogue), rate));
        }
        Site::Demo => {
            registry
                .register(
                    DEMO_LIST_PAGE,
                    FaultInjector::new(DemoListPage { items: args.items }, rate),
                )
                .register(DEMO_ITEM, FaultInjector::new(DemoItem, rate));
        }
    }
    Ok(registry)
}

/// The initial tasks. For the catalogue this fetches the index page.
pub async fn seed(site: Site, args: &SiteArgs, pages: u32) -> Result<Vec<Task>> {
    match site {
        Site::Catalogue => args
            .catalogue()?
            .seed()
            .await
            .context("Failed to discover catalogue pages"),
        Site::Demo => Ok((1..=pages)
            .map(|page| Task::new(DEMO_LIST_PAGE).with_param("page", page))
            .collect()),
    }
}

/// `demo.list_page {page}`: enqueue `items` item tasks.
struct DemoListPage {
    items: u32,
}

#[async_trait]
impl Operation for DemoListPage {
    async fn run(&self, ctx: &mut TaskContext, params: &Params) -> Result<(), AppError> {
        let page: u32 = params.get("page")?;
        for index in 1..=self.items {
            ctx.enqueue(
                Task::new(DEMO_ITEM)
                    .with_param("page", page)
                    .with_param("index", index),
            );
        }
        Ok(())
    }
}

/// `demo.item {page, index}`: record its coordinates.
struct DemoItem;

#[async_trait]
impl Operation for DemoItem {
    async fn run(&self, ctx: &mut TaskContext, params: &Params) -> Result<(), AppError> {
        let page: u32 = params.get("page")?;
        let index: u32 = params.get("index")?;
        ctx.record(&serde_json::json!({ "page": page, "index": index }))
    }
}
