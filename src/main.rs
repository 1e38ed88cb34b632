mod app;
mod gateway;
mod store;
mod types;
mod workflow;

#[tokio::main]
async fn main() {
    app::run().await;
}
