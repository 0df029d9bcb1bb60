fn main() {
    yolo_serve::run_cli();
}
