//! Firehose Connector - Entry Point
//!
//! Streams a newline-delimited feed into a partitioned Redis Streams log.

#[tokio::main]
async fn main() -> eyre::Result<()> {
    firehose_connector::run().await
}
