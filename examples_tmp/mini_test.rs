use std::sync::Arc;
use opvisor::{AsyncOp, NopOp, OpListener, OpState};

#[tokio::main]
async fn main() {
    let op = NopOp::new();
    op.start().await.unwrap();
    op.wait_for_finished().await;
    println!("done: {:?}", op.state());
}
