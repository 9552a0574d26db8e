mod app;
mod assistant;
mod funnel;
mod gateway;
mod normalize;
mod pipeline;
mod prompting;
mod store;
mod types;

#[tokio::main]
async fn main() {
    app::run().await;
}
