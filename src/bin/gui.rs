// Desktop client for the surgical tray detection service.
//
// Talks to the service over loopback HTTP only; holds at most one request in
// flight at a time. Build with: cargo run --features gui --bin gui

use std::collections::HashMap;
use std::time::Duration;

use iced::widget::{
    button, column, container, image as iced_image, pick_list, row, scrollable, text, text_input,
};
use iced::{Alignment, Color, Element, Length, Task, Theme};
use rfd::AsyncFileDialog;

use trayscan::core::types::{ApiDetection, TrayCheckReport, TrayConfiguration};
use trayscan::utils::draw_detection_overlay;

fn main() -> iced::Result {
    iced::application(TrayClient::new, TrayClient::update, TrayClient::view)
        .title("Surgical Tray Detection")
        .theme(|_| Theme::Dark)
        .window_size((1200.0, 680.0))
        .run()
}

fn service_url() -> String {
    std::env::var("TRAYSCAN_URL").unwrap_or_else(|_| "http://127.0.0.1:8000".to_string())
}

const ERROR_RED: Color = Color::from_rgb(0.92, 0.35, 0.35);

#[derive(Debug, Clone)]
enum Message {
    TraysLoaded(Result<HashMap<String, TrayConfiguration>, String>),
    TraySelected(String),
    WeightChanged(String),
    BrowseImage,
    ImagePicked(Option<(String, Vec<u8>)>),
    Submit,
    CheckFinished(Result<TrayCheckReport, String>),
    InferFinished(Result<Vec<ApiDetection>, String>),
}

#[derive(Default)]
struct TrayClient {
    tray_names: Vec<String>,
    selected_tray: Option<String>,
    weight_input: String,

    image_name: Option<String>,
    image_bytes: Option<Vec<u8>>,

    in_flight: bool,
    status: Option<String>,

    detections: Vec<ApiDetection>,
    report: Option<TrayCheckReport>,
    overlay: Option<iced_image::Handle>,
}

impl TrayClient {
    fn new() -> (Self, Task<Message>) {
        (
            Self::default(),
            Task::perform(fetch_trays(service_url()), Message::TraysLoaded),
        )
    }

    fn update(&mut self, message: Message) -> Task<Message> {
        match message {
            Message::TraysLoaded(Ok(trays)) => {
                let mut names: Vec<String> = trays.keys().cloned().collect();
                names.sort();
                if self.selected_tray.is_none() {
                    self.selected_tray = names.first().cloned();
                }
                self.tray_names = names;
                Task::none()
            }
            Message::TraysLoaded(Err(e)) => {
                self.status = Some(format!("Could not load tray catalog: {e}"));
                Task::none()
            }
            Message::TraySelected(name) => {
                self.selected_tray = Some(name);
                Task::none()
            }
            Message::WeightChanged(value) => {
                self.weight_input = value;
                Task::none()
            }
            Message::BrowseImage => Task::perform(pick_image(), Message::ImagePicked),
            Message::ImagePicked(Some((name, bytes))) => {
                self.image_name = Some(name);
                self.image_bytes = Some(bytes);
                self.detections.clear();
                self.report = None;
                self.overlay = None;
                self.status = None;
                Task::none()
            }
            Message::ImagePicked(None) => Task::none(),
            Message::Submit => self.submit(),
            Message::CheckFinished(result) => {
                self.in_flight = false;
                match result {
                    Ok(report) => {
                        self.detections = report.detections.clone();
                        self.report = Some(report);
                        self.refresh_overlay();
                    }
                    Err(e) => self.status = Some(e),
                }
                Task::none()
            }
            Message::InferFinished(result) => {
                self.in_flight = false;
                match result {
                    Ok(detections) => {
                        self.detections = detections;
                        self.report = None;
                        self.refresh_overlay();
                    }
                    Err(e) => self.status = Some(e),
                }
                Task::none()
            }
        }
    }

    fn submit(&mut self) -> Task<Message> {
        let Some(bytes) = self.image_bytes.clone() else {
            self.status = Some("Please select an image".to_string());
            return Task::none();
        };

        let measured_weight = match self.weight_input.trim() {
            "" => None,
            value => match value.parse::<f32>() {
                Ok(weight) => Some(weight),
                Err(_) => {
                    self.status = Some("Please enter a valid weight".to_string());
                    return Task::none();
                }
            },
        };

        self.in_flight = true;
        self.status = None;

        match self.selected_tray.clone() {
            Some(tray) => Task::perform(
                submit_check(service_url(), bytes, tray, measured_weight),
                Message::CheckFinished,
            ),
            None => Task::perform(
                submit_infer(service_url(), bytes),
                Message::InferFinished,
            ),
        }
    }

    fn refresh_overlay(&mut self) {
        let Some(bytes) = &self.image_bytes else {
            return;
        };
        match image::load_from_memory(bytes) {
            Ok(img) => {
                let canvas = draw_detection_overlay(&img, &self.detections);
                let (width, height) = (canvas.width(), canvas.height());
                self.overlay = Some(iced_image::Handle::from_rgba(
                    width,
                    height,
                    canvas.into_raw(),
                ));
            }
            Err(e) => self.status = Some(format!("Failed to render overlay: {e}")),
        }
    }

    fn view(&self) -> Element<'_, Message> {
        let image_label = self
            .image_name
            .as_deref()
            .unwrap_or("No image selected");

        let mut submit = button("Detect instruments");
        if !self.in_flight && self.image_bytes.is_some() {
            submit = submit.on_press(Message::Submit);
        }

        let mut controls = column![
            text("Surgical Tray Detection").size(28),
            row![
                text("Tray:"),
                pick_list(
                    self.tray_names.clone(),
                    self.selected_tray.clone(),
                    Message::TraySelected
                ),
            ]
            .spacing(10)
            .align_y(Alignment::Center),
            row![
                text("Measured weight (kg):"),
                text_input("0.0", &self.weight_input).on_input(Message::WeightChanged),
            ]
            .spacing(10)
            .align_y(Alignment::Center),
            row![
                button("Browse...").on_press(Message::BrowseImage),
                text(image_label),
            ]
            .spacing(10)
            .align_y(Alignment::Center),
            submit,
        ]
        .spacing(14)
        .padding(16)
        .width(420);

        if let Some(status) = &self.status {
            controls = controls.push(text(status).color(ERROR_RED));
        }
        if self.in_flight {
            controls = controls.push(text("Detecting..."));
        }
        controls = controls.push(scrollable(self.results_panel()).height(Length::Fill));

        let preview: Element<'_, Message> = match &self.overlay {
            Some(handle) => container(
                iced_image(handle.clone())
                    .width(Length::Fill)
                    .height(Length::Fill),
            )
            .padding(10)
            .into(),
            None => container(text("Detections will appear here"))
                .center(Length::Fill)
                .into(),
        };

        row![controls, preview].into()
    }

    fn results_panel(&self) -> Element<'_, Message> {
        let mut panel = column![].spacing(6);

        if !self.detections.is_empty() {
            panel = panel.push(text("Detected instruments:").size(18));
            for detection in &self.detections {
                panel = panel.push(text(format!(
                    "  {} ({:.0}%)",
                    detection.label,
                    detection.confidence * 100.0
                )));
            }
        }

        if let Some(report) = &self.report {
            panel = panel.push(text(format!("Set complete: {}", report.complete)).size(18));

            if let Some(mismatch) = &report.weight_mismatch {
                panel = panel.push(
                    text(format!(
                        "Weight mismatch: measured {:.2} kg, expected {:.2} kg",
                        mismatch.measured_kg, mismatch.expected_kg
                    ))
                    .color(ERROR_RED),
                );
            }

            if !report.missing.is_empty() {
                panel = panel.push(
                    text(format!("Missing items ({}):", report.missing.len())).color(ERROR_RED),
                );
                for item in &report.missing {
                    panel = panel.push(
                        text(format!(
                            "  {}: found {}, expected {}",
                            item.name, item.found, item.expected
                        ))
                        .color(ERROR_RED),
                    );
                }
            }
        }

        panel.into()
    }
}

async fn fetch_trays(base: String) -> Result<HashMap<String, TrayConfiguration>, String> {
    let response = reqwest::get(format!("{base}/trays"))
        .await
        .map_err(|e| format!("service unreachable: {e}"))?;
    if !response.status().is_success() {
        return Err(format!("service returned {}", response.status()));
    }
    response.json().await.map_err(|e| e.to_string())
}

async fn pick_image() -> Option<(String, Vec<u8>)> {
    let handle = AsyncFileDialog::new()
        .set_title("Select Image")
        .add_filter("Images", &["jpg", "jpeg", "png"])
        .pick_file()
        .await?;
    let bytes = handle.read().await;
    Some((handle.file_name(), bytes))
}

fn http_client() -> Result<reqwest::Client, String> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .build()
        .map_err(|e| e.to_string())
}

fn image_form(bytes: Vec<u8>) -> reqwest::multipart::Form {
    reqwest::multipart::Form::new()
        .part("image", reqwest::multipart::Part::bytes(bytes).file_name("image.jpg"))
}

async fn submit_check(
    base: String,
    bytes: Vec<u8>,
    tray: String,
    measured_weight: Option<f32>,
) -> Result<TrayCheckReport, String> {
    let mut form = image_form(bytes).text("tray", tray);
    if let Some(weight) = measured_weight {
        form = form.text("measured_weight", weight.to_string());
    }

    let response = http_client()?
        .post(format!("{base}/check"))
        .multipart(form)
        .send()
        .await
        .map_err(|e| format!("service unreachable: {e}"))?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(format!("request failed ({status}): {body}"));
    }
    response.json().await.map_err(|e| e.to_string())
}

async fn submit_infer(base: String, bytes: Vec<u8>) -> Result<Vec<ApiDetection>, String> {
    let response = http_client()?
        .post(format!("{base}/infer"))
        .multipart(image_form(bytes))
        .send()
        .await
        .map_err(|e| format!("service unreachable: {e}"))?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(format!("request failed ({status}): {body}"));
    }
    response.json().await.map_err(|e| e.to_string())
}
