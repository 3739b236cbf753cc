use super::{ApiResponse, HttpRequest, HttpResponse};
use crate::enforcer::Enforcer;
use log::warn;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};

/// One client policy update as it arrives on the wire. The rate and burst
/// lists are parallel arrays holding two values per rate limit stage.
#[derive(Debug, Serialize, Deserialize)]
pub struct ClientUpdate {
    pub dst_addr: String,
    pub src_addr: String,
    pub priority: u32,
    #[serde(default)]
    pub rate_limit_rates: Vec<f64>,
    #[serde(default)]
    pub rate_limit_bursts: Vec<f64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ClientAddr {
    pub dst_addr: String,
    pub src_addr: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UpdateClientsRequest {
    pub clients: Vec<ClientUpdate>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RemoveClientsRequest {
    pub clients: Vec<ClientAddr>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct OccupancyResponse {
    pub occupancy: f64,
}

/// Snapshot of one table entry for the listing endpoint
#[derive(Debug, Serialize, Deserialize)]
pub struct ClientInfo {
    pub dst_addr: String,
    pub src_addr: String,
    pub id: u32,
    pub priority: u32,
    pub rate: f64,
    pub rate_limit_stages: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ClientsResponse {
    pub clients: Vec<ClientInfo>,
}

fn parse_addr(which: &str, addr: &str) -> Option<Ipv4Addr> {
    match addr.parse::<Ipv4Addr>() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            warn!("Invalid {} address: {}", which, addr);
            None
        }
    }
}

#[derive(Clone)]
pub struct EnforcerApiHandler {
    enforcer: Arc<Mutex<Enforcer>>,
}

impl EnforcerApiHandler {
    pub fn new(enforcer: Arc<Mutex<Enforcer>>) -> Self {
        Self { enforcer }
    }

    pub fn supported_routes(&self) -> Vec<&'static str> {
        vec![
            "/api/ping",
            "/api/clients",
            "/api/clients/update",
            "/api/clients/remove",
            "/api/occupancy",
        ]
    }

    pub async fn handle_request(
        &self,
        request: &HttpRequest,
    ) -> Result<HttpResponse, anyhow::Error> {
        match request.path.as_str() {
            "/api/ping" => {
                if request.method == "GET" {
                    self.handle_ping()
                } else {
                    Ok(HttpResponse::error(405, "Method not allowed".to_string()))
                }
            }
            "/api/clients" => {
                if request.method == "GET" {
                    self.handle_list_clients()
                } else {
                    Ok(HttpResponse::error(405, "Method not allowed".to_string()))
                }
            }
            "/api/clients/update" => {
                if request.method == "POST" {
                    self.handle_update_clients(request)
                } else {
                    Ok(HttpResponse::error(405, "Method not allowed".to_string()))
                }
            }
            "/api/clients/remove" => {
                if request.method == "POST" {
                    self.handle_remove_clients(request)
                } else {
                    Ok(HttpResponse::error(405, "Method not allowed".to_string()))
                }
            }
            "/api/occupancy" => {
                if request.method == "GET" {
                    self.handle_occupancy(request)
                } else {
                    Ok(HttpResponse::error(405, "Method not allowed".to_string()))
                }
            }
            _ => Ok(HttpResponse::not_found()),
        }
    }

    fn handle_ping(&self) -> Result<HttpResponse, anyhow::Error> {
        let body = serde_json::to_string(&ApiResponse::success(()))?;
        Ok(HttpResponse::ok(body))
    }

    /// Apply a batch of policy updates. Items are validated independently;
    /// an invalid item is skipped and the rest of the batch still applies.
    fn handle_update_clients(&self, request: &HttpRequest) -> Result<HttpResponse, anyhow::Error> {
        let body = match request.body.as_deref() {
            Some(body) if !body.trim().is_empty() => body,
            _ => return Ok(HttpResponse::error(400, "Missing request body".to_string())),
        };
        let update_request: UpdateClientsRequest = match serde_json::from_str(body) {
            Ok(parsed) => parsed,
            Err(e) => return Ok(HttpResponse::error(400, format!("Invalid request: {}", e))),
        };

        let mut enforcer = self.enforcer.lock().unwrap();
        let num_priorities = enforcer.num_priorities();
        let max_chain = ((enforcer.num_levels() + 1) * 2) as usize;
        for update in &update_request.clients {
            if update.priority >= num_priorities {
                warn!(
                    "Invalid priority: {}, must be < {}",
                    update.priority, num_priorities
                );
                continue;
            }
            if update.rate_limit_rates.len() != update.rate_limit_bursts.len() {
                warn!(
                    "Mismatched rate limit lists for dst {} src {}: {} rates vs {} bursts",
                    update.dst_addr,
                    update.src_addr,
                    update.rate_limit_rates.len(),
                    update.rate_limit_bursts.len()
                );
                continue;
            }
            if update.rate_limit_rates.len() > max_chain {
                warn!(
                    "Too many rate limits: {}, must be <= {}",
                    update.rate_limit_rates.len(),
                    max_chain
                );
                continue;
            }
            let (dst, src) = match (
                parse_addr("dst", &update.dst_addr),
                parse_addr("src", &update.src_addr),
            ) {
                (Some(dst), Some(src)) => (dst, src),
                _ => continue,
            };
            enforcer.update_client(
                dst,
                src,
                update.priority,
                &update.rate_limit_rates,
                &update.rate_limit_bursts,
            );
        }

        let body = serde_json::to_string(&ApiResponse::success(()))?;
        Ok(HttpResponse::ok(body))
    }

    fn handle_remove_clients(&self, request: &HttpRequest) -> Result<HttpResponse, anyhow::Error> {
        let body = match request.body.as_deref() {
            Some(body) if !body.trim().is_empty() => body,
            _ => return Ok(HttpResponse::error(400, "Missing request body".to_string())),
        };
        let remove_request: RemoveClientsRequest = match serde_json::from_str(body) {
            Ok(parsed) => parsed,
            Err(e) => return Ok(HttpResponse::error(400, format!("Invalid request: {}", e))),
        };

        let mut enforcer = self.enforcer.lock().unwrap();
        for client in &remove_request.clients {
            let (dst, src) = match (
                parse_addr("dst", &client.dst_addr),
                parse_addr("src", &client.src_addr),
            ) {
                (Some(dst), Some(src)) => (dst, src),
                _ => continue,
            };
            enforcer.remove_client(dst, src);
        }

        let body = serde_json::to_string(&ApiResponse::success(()))?;
        Ok(HttpResponse::ok(body))
    }

    fn handle_occupancy(&self, request: &HttpRequest) -> Result<HttpResponse, anyhow::Error> {
        let (dst, src) = match (
            request.query_params.get("dst_addr"),
            request.query_params.get("src_addr"),
        ) {
            (Some(dst), Some(src)) => (dst, src),
            _ => {
                return Ok(HttpResponse::error(
                    400,
                    "Missing dst_addr or src_addr parameter".to_string(),
                ))
            }
        };
        let (dst, src) = match (parse_addr("dst", dst), parse_addr("src", src)) {
            (Some(dst), Some(src)) => (dst, src),
            _ => return Ok(HttpResponse::error(400, "Invalid address".to_string())),
        };

        let occupancy = self.enforcer.lock().unwrap().get_occupancy(dst, src);
        let body = serde_json::to_string(&ApiResponse::success(OccupancyResponse { occupancy }))?;
        Ok(HttpResponse::ok(body))
    }

    fn handle_list_clients(&self) -> Result<HttpResponse, anyhow::Error> {
        let enforcer = self.enforcer.lock().unwrap();
        let mut clients: Vec<ClientInfo> = enforcer
            .clients()
            .iter()
            .map(|((dst, src), state)| ClientInfo {
                dst_addr: dst.to_string(),
                src_addr: src.to_string(),
                id: state.id,
                priority: state.priority,
                rate: state.rate,
                rate_limit_stages: state.rate_limit_length / 2,
            })
            .collect();
        clients.sort_by_key(|c| c.id);
        let body = serde_json::to_string(&ApiResponse::success(ClientsResponse { clients }))?;
        Ok(HttpResponse::ok(body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tc::testing::{Recorder, RecordingRunner};
    use crate::tc::TcDriver;
    use std::collections::HashMap;

    fn test_handler() -> (EnforcerApiHandler, Recorder) {
        let recorder = Recorder::default();
        let tc = TcDriver::with_runner("eth0", Box::new(RecordingRunner(recorder.clone())));
        let enforcer = Arc::new(Mutex::new(Enforcer::with_driver(125_000_000, 7, 5, tc)));
        (EnforcerApiHandler::new(enforcer), recorder)
    }

    fn post(path: &str, body: &str) -> HttpRequest {
        HttpRequest {
            method: "POST".to_string(),
            path: path.to_string(),
            query_params: HashMap::new(),
            body: Some(body.to_string()),
        }
    }

    fn get(path: &str, params: &[(&str, &str)]) -> HttpRequest {
        HttpRequest {
            method: "GET".to_string(),
            path: path.to_string(),
            query_params: params
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            body: None,
        }
    }

    #[tokio::test]
    async fn test_ping() {
        let (handler, _recorder) = test_handler();
        let response = handler.handle_request(&get("/api/ping", &[])).await.unwrap();
        assert_eq!(response.status, 200);
        assert!(response.body.contains("success"));
    }

    #[tokio::test]
    async fn test_update_applies_valid_items_and_skips_invalid() {
        let (handler, recorder) = test_handler();
        let body = r#"{"clients":[
            {"dst_addr":"192.168.0.1","src_addr":"192.168.0.2","priority":2,
             "rate_limit_rates":[1000000,2000000],"rate_limit_bursts":[1500,3000]},
            {"dst_addr":"192.168.0.3","src_addr":"192.168.0.4","priority":9,
             "rate_limit_rates":[],"rate_limit_bursts":[]},
            {"dst_addr":"192.168.0.5","src_addr":"192.168.0.6","priority":1,
             "rate_limit_rates":[1,2,3],"rate_limit_bursts":[1,2]},
            {"dst_addr":"not-an-ip","src_addr":"192.168.0.8","priority":1,
             "rate_limit_rates":[],"rate_limit_bursts":[]}
        ]}"#;
        let response = handler
            .handle_request(&post("/api/clients/update", body))
            .await
            .unwrap();
        assert_eq!(response.status, 200);

        // Only the first item survived validation
        let list = handler
            .handle_request(&get("/api/clients", &[]))
            .await
            .unwrap();
        let parsed: ApiResponse<ClientsResponse> = serde_json::from_str(&list.body).unwrap();
        let clients = parsed.data.unwrap().clients;
        assert_eq!(clients.len(), 1);
        assert_eq!(clients[0].dst_addr, "192.168.0.1");
        assert_eq!(clients[0].priority, 2);
        assert_eq!(clients[0].rate_limit_stages, 1);
        assert!(!recorder.drain().is_empty());
    }

    #[tokio::test]
    async fn test_update_rejects_overlong_chain() {
        let (handler, recorder) = test_handler();
        let rates: Vec<String> = (0..14).map(|_| "1000".to_string()).collect();
        let body = format!(
            r#"{{"clients":[{{"dst_addr":"10.0.0.1","src_addr":"10.0.0.2","priority":0,
               "rate_limit_rates":[{0}],"rate_limit_bursts":[{0}]}}]}}"#,
            rates.join(",")
        );
        let response = handler
            .handle_request(&post("/api/clients/update", &body))
            .await
            .unwrap();
        assert_eq!(response.status, 200);
        assert!(recorder.drain().is_empty());
    }

    #[tokio::test]
    async fn test_remove_clients() {
        let (handler, recorder) = test_handler();
        let body = r#"{"clients":[{"dst_addr":"192.168.0.1","src_addr":"192.168.0.2","priority":0}]}"#;
        handler
            .handle_request(&post("/api/clients/update", body))
            .await
            .unwrap();
        recorder.drain();

        let body = r#"{"clients":[{"dst_addr":"192.168.0.1","src_addr":"192.168.0.2"}]}"#;
        let response = handler
            .handle_request(&post("/api/clients/remove", body))
            .await
            .unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(
            recorder.drain(),
            vec!["filter del dev eth0 parent 1: prio 1 u32"]
        );
    }

    #[tokio::test]
    async fn test_occupancy_unknown_client() {
        let (handler, _recorder) = test_handler();
        let response = handler
            .handle_request(&get(
                "/api/occupancy",
                &[("dst_addr", "10.0.0.1"), ("src_addr", "10.0.0.2")],
            ))
            .await
            .unwrap();
        assert_eq!(response.status, 200);
        let parsed: ApiResponse<OccupancyResponse> = serde_json::from_str(&response.body).unwrap();
        assert_eq!(parsed.data.unwrap().occupancy, 0.0);
    }

    #[tokio::test]
    async fn test_occupancy_missing_params() {
        let (handler, _recorder) = test_handler();
        let response = handler
            .handle_request(&get("/api/occupancy", &[("dst_addr", "10.0.0.1")]))
            .await
            .unwrap();
        assert_eq!(response.status, 400);
    }

    #[tokio::test]
    async fn test_update_without_body() {
        let (handler, _recorder) = test_handler();
        let response = handler
            .handle_request(&post("/api/clients/update", ""))
            .await
            .unwrap();
        assert_eq!(response.status, 400);
    }
}
