fn main() {
    voice_pipeline_client::run()
}
