use opvisor::NopOp;

#[tokio::test]
async fn probe_nop_no_pause() {
    eprintln!("a");
    let op = NopOp::new();
    eprintln!("b");
    op.start().await.unwrap();
    eprintln!("c");
    op.wait_for_finished().await;
    eprintln!("d: {:?}", op.state());
}
