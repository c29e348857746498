fn main() -> anyhow::Result<()> {
    ma_ai_lib::run()
}
