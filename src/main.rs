use clap::{Parser, ValueEnum};
use content_set::core::{Item, ItemId, MemoryPartition, PartitionId, PartitionSource, Value};
use content_set::engine::{SetEvent, SetView};
use content_set::event::ChangeFeed;
use content_set::query::{FilterCriteria, Operator, SortCriteria};
use content_set::storage::{ContentSetDefinition, DefinitionStore};
use content_set::{EngineConfig, SetEngine, UpdateMode};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Copy, Clone, Debug, ValueEnum)]
enum ModeArg {
    Sync,
    Async,
}

impl From<ModeArg> for UpdateMode {
    fn from(m: ModeArg) -> Self {
        match m {
            ModeArg::Sync => UpdateMode::Synchronous,
            ModeArg::Async => UpdateMode::Asynchronous,
        }
    }
}

/// content-set demo：在生成的内存分区上构建一个过滤、排序的内容集
#[derive(Parser, Debug)]
#[command(name = "content-set", version, about)]
struct Cli {
    /// 分区数
    #[arg(long, default_value_t = 3)]
    partitions: u32,
    /// 每个分区的记录数
    #[arg(long, default_value_t = 1000)]
    items: usize,
    /// 更新模式（缺省取定义或配置）
    #[arg(long, value_enum)]
    mode: Option<ModeArg>,
    /// 标题 glob，例如 "*love*"
    #[arg(long)]
    glob: Option<String>,
    /// 标题模糊匹配
    #[arg(long)]
    fuzzy: Option<String>,
    #[arg(long)]
    artist: Option<String>,
    /// 只保留该年份及之后
    #[arg(long)]
    since: Option<i64>,
    /// 排序键（旧格式），可重复："year desc"、"title asc"
    #[arg(long = "sort")]
    sort: Vec<String>,
    /// 从定义文件加载条件（存在时优先于命令行条件）
    #[arg(long)]
    definition: Option<PathBuf>,
    /// 把最终条件保存为定义文件
    #[arg(long)]
    save: Option<PathBuf>,
    #[arg(long)]
    config: Option<PathBuf>,
    /// 打印前 K 行
    #[arg(long, default_value_t = 10)]
    rows: usize,
    /// 构建完成后随机修改的记录数
    #[arg(long, default_value_t = 0)]
    churn: usize,
}

const WORDS: &[&str] = &[
    "love", "night", "river", "gold", "echo", "winter", "fire", "blue", "road", "dream", "stone",
    "light", "city", "rain", "heart", "wild",
];
const ARTISTS: &[&str] = &["Aster", "Birch", "Cobalt", "Dune", "Ember", "Fable"];

/// 生成测试数据用的 xorshift
struct Rng(u64);

impl Rng {
    fn next(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.0 = x;
        x
    }

    fn pick<'a>(&mut self, list: &[&'a str]) -> &'a str {
        list[(self.next() % list.len() as u64) as usize]
    }
}

fn record(rng: &mut Rng) -> Item {
    let title = format!("{} {}", rng.pick(WORDS), rng.pick(WORDS));
    Item::detached()
        .with("title", title)
        .with("artist", rng.pick(ARTISTS))
        .with("year", 1960 + (rng.next() % 65) as i64)
        .with("rating", (rng.next() % 50) as f64 / 10.0)
}

fn filter_from(cli: &Cli) -> FilterCriteria {
    let mut clauses = Vec::new();
    if let Some(g) = &cli.glob {
        clauses.push(FilterCriteria::clause("title", Operator::Glob, g.as_str()));
    }
    if let Some(f) = &cli.fuzzy {
        clauses.push(FilterCriteria::clause("title", Operator::Fuzzy, f.as_str()));
    }
    if let Some(a) = &cli.artist {
        clauses.push(FilterCriteria::equals("artist", a.as_str()));
    }
    if let Some(y) = cli.since {
        clauses.push(FilterCriteria::clause("year", Operator::Greater, y - 1));
    }
    clauses
        .into_iter()
        .reduce(FilterCriteria::and)
        .unwrap_or(FilterCriteria::All)
}

fn text(item: &Item, attr: &str) -> String {
    match item.get(attr) {
        Some(Value::Text(s)) => s.clone(),
        Some(v) => v.to_string(),
        None => "-".to_string(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::load_default()?,
    };

    let loaded = match &cli.definition {
        Some(path) => DefinitionStore::new(path.clone()).load().await?,
        None => None,
    };
    let definition = match loaded {
        Some(def) => {
            info!("using definition `{}`", def.name);
            def
        }
        None => {
            let sort = if cli.sort.is_empty() {
                SortCriteria::from_legacy(&["year desc", "title asc"])?
            } else {
                SortCriteria::from_legacy(cli.sort.as_slice())?
            };
            ContentSetDefinition::new("demo", filter_from(&cli), sort).with_mode(config.update_mode)
        }
    };
    config.update_mode = cli.mode.map(UpdateMode::from).unwrap_or(definition.mode);
    info!(
        "filter: {} | sort: {:?} | mode: {:?}",
        definition.filter,
        definition.legacy_sort(),
        config.update_mode
    );

    // 初始灌入的事件也走变更通道，容量按数据量放大
    let total = cli.partitions as usize * cli.items;
    let (tx, mut rx) = ChangeFeed::bounded(config.change_feed_capacity.max(total + 1));
    let mut rng = Rng(0x9E37_79B9_7F4A_7C15);
    let partitions: Vec<Arc<MemoryPartition>> = (0..cli.partitions)
        .map(|p| {
            let part = MemoryPartition::new(PartitionId(p)).with_feed(tx.clone());
            for _ in 0..cli.items {
                part.insert(record(&mut rng));
            }
            Arc::new(part)
        })
        .collect();
    info!("generated {} records in {} partitions", total, cli.partitions);

    let sources: Vec<Arc<dyn PartitionSource>> = partitions
        .iter()
        .map(|p| p.clone() as Arc<dyn PartitionSource>)
        .collect();
    let mut engine = content_set::MergeDiffEngine::with_config(
        sources,
        definition.filter.clone(),
        definition.sort.clone(),
        config.clone(),
    );
    engine.subscribe(Box::new(|ev: &SetEvent, view: &dyn SetView| {
        tracing::debug!("{:?} (count {})", ev, view.value_count());
    }));
    engine.drain_changes(&mut rx);

    let settle = config.barrier_wait() * config.shutdown_retries.max(1);
    if !engine.wait_for_update(settle) {
        tracing::warn!("initial cycle still running after {:?}", settle);
    }

    for _ in 0..cli.churn {
        if partitions.is_empty() {
            break;
        }
        let part = &partitions[(rng.next() % partitions.len() as u64) as usize];
        let local = 1 + rng.next() % cli.items.max(1) as u64;
        let id = ItemId::new(part.partition_id(), local);
        if rng.next() % 4 == 0 {
            part.remove(id);
        } else {
            part.update(id, record(&mut rng));
        }
        engine.drain_changes(&mut rx);
        engine.process_events();
    }
    if !engine.wait_for_update(settle) {
        tracing::warn!("last cycle still running after {:?}", settle);
    }

    let count = engine.count();
    println!("{} of {} records match", count, total);
    for i in 0..cli.rows.min(count) {
        let Some(item) = engine.content(i) else { break };
        println!(
            "{:>5}  {:<24} {:<8} {:>4}  {}",
            i,
            text(&item, "title"),
            text(&item, "artist"),
            text(&item, "year"),
            text(&item, "rating")
        );
    }
    println!("{}", engine.stats());

    if let Some(path) = cli.save {
        let def = ContentSetDefinition::capture(definition.name.as_str(), &engine);
        DefinitionStore::new(path).save(&def).await?;
    }
    Ok(())
}
