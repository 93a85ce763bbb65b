use mailscan::config::Config;
use mailscan::db;
use mailscan::jobs::{AttachmentMetadata, JobPayload, JobStore, PgJobStore};
use mailscan::queue::RedisStreamQueue;
use std::env;
use uuid::Uuid;

const USAGE: &str = "mailscanctl <command>\n\
     Commands:\n\
     - migrate\n\
     - reset\n\
     - seed <n>\n\
     - show <job_id>\n\
     - counts\n\
     \n\
     Uses DATABASE_URL, REDIS_URL and MAILSCAN_STREAM (see worker config).\n";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = env::args().collect();

    let Some(command) = args.get(1) else {
        eprintln!("{USAGE}");
        std::process::exit(2);
    };

    let cfg = Config::from_env()?;
    let pool = db::make_pool(&cfg.database_url).await?;
    let store = PgJobStore::new(pool.clone());

    match command.as_str() {
        "migrate" => {
            db::run_migrations(&pool).await?;
            println!("migrations OK");
        }
        "reset" => {
            store.truncate().await?;
            println!("reset OK");
        }
        "seed" => {
            let n: usize = args.get(2).and_then(|s| s.parse().ok()).unwrap_or(5);
            let queue = RedisStreamQueue::connect(&cfg.redis_url).await?;
            seed(&store, &queue, &cfg.stream, n).await?;
        }
        "show" => {
            let Some(raw) = args.get(2) else {
                eprintln!("usage: mailscanctl show <job_id>");
                std::process::exit(2);
            };
            let job_id: Uuid = raw.parse()?;
            match store.get(job_id).await? {
                Some(job) => println!("{}", serde_json::to_string_pretty(&job)?),
                None => println!("job {job_id} not found"),
            }
        }
        "counts" => {
            for (status, count) in store.count_by_status().await? {
                println!("{status:<10} {count}");
            }
        }
        other => {
            eprintln!("Unknown command: {other}\n\n{USAGE}");
            std::process::exit(2);
        }
    }

    Ok(())
}

async fn seed(
    store: &PgJobStore,
    queue: &RedisStreamQueue,
    stream: &str,
    n: usize,
) -> anyhow::Result<()> {
    for i in 0..n {
        let job = store.insert_pending(Uuid::new_v4()).await?;

        let payload = JobPayload {
            job_id: job.id,
            source_message_id: Some(format!("mock-msg-{i}")),
            attachment_metadata: vec![
                AttachmentMetadata {
                    filename: "invoice.pdf".into(),
                    attachment_id: Some(format!("mock-att-{i}-0")),
                    mime_type: "application/pdf".into(),
                    size: 10_240,
                },
                AttachmentMetadata {
                    filename: "evil.exe".into(),
                    attachment_id: Some(format!("mock-att-{i}-1")),
                    mime_type: "application/x-msdownload".into(),
                    size: 512,
                },
            ],
            extracted_urls: vec![
                "http://malware-example.com/login".into(),
                "https://fishing-site.com".into(),
            ],
        };

        let delivery_id = queue.publish(stream, &payload).await?;
        println!("seeded job {} as {}", job.id, delivery_id);
    }

    println!("seed OK ({n} jobs)");
    Ok(())
}
