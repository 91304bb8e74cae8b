use std::collections::BTreeSet;

use serde::Serialize;

/// One question an accident report has to answer, and the phrases that count as an answer.
#[derive(Debug, Clone, Copy)]
pub struct ChecklistQuestion {
    pub question: &'static str,
    /// Lowercase phrases matched at the start of a word; a trailing space also
    /// pins the end of the word. Any one of them marks the question as answered.
    pub probes: &'static [&'static str],
}

pub const REPORT_QUESTIONS: &[ChecklistQuestion] = &[
    ChecklistQuestion {
        question: "¿Qué ha ocurrido?",
        probes: &[
            "accidente", "choque", "chocado", "choqué", "colisión", "golpe", "volcado", "vuelco",
            "volqué", "incendio", "robo", "ha pasado", "ocurrió",
        ],
    },
    ChecklistQuestion {
        question: "¿Dónde ha ocurrido?",
        probes: &[
            "carretera", "camino", "finca", "parcela", "calle", "kilómetro", "cerca de",
            "en el pueblo", "ubicación", "autovía",
        ],
    },
    ChecklistQuestion {
        question: "¿Cuándo ha ocurrido?",
        probes: &[
            "hoy ", "ayer", "esta mañana", "esta tarde", "esta noche", "a las ", "lunes", "martes",
            "miércoles", "jueves", "viernes", "sábado", "domingo", "hora",
        ],
    },
    ChecklistQuestion {
        question: "¿Qué vehículos están implicados?",
        probes: &[
            "tractor", "coche", "camión", "furgoneta", "remolque", "moto", "cosechadora",
            "vehículo",
        ],
    },
    ChecklistQuestion {
        question: "¿Hay personas heridas?",
        probes: &["herido", "herida", "lesión", "lesiones", "ambulancia", "hospital", "ileso"],
    },
    ChecklistQuestion {
        question: "¿Hay terceros implicados?",
        probes: &["tercero", "otro conductor", "otra persona", "vecino", "propiedad", "valla"],
    },
    ChecklistQuestion {
        question: "¿Se ha presentado denuncia o atestado policial?",
        probes: &["policía", "guardia civil", "denuncia", "atestado", "agentes"],
    },
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportStatus {
    Complete,
    Incomplete,
}

/// Tracks which report questions a transcript answers.
#[derive(Debug, Clone, Copy)]
pub struct ReportChecklist {
    questions: &'static [ChecklistQuestion],
}

impl Default for ReportChecklist {
    fn default() -> Self {
        Self::new(REPORT_QUESTIONS)
    }
}

impl ReportChecklist {
    pub fn new(questions: &'static [ChecklistQuestion]) -> Self {
        Self { questions }
    }

    /// Indices of the questions `transcript` answers. Matching ignores case and punctuation.
    pub fn evaluate(&self, transcript: &str) -> BTreeSet<usize> {
        let text = normalize(transcript);
        self.questions
            .iter()
            .enumerate()
            .filter(|(_, q)| {
                q.probes
                    .iter()
                    .any(|probe| text.contains(&format!(" {probe}")))
            })
            .map(|(i, _)| i)
            .collect()
    }

    /// Questions still open, in checklist order.
    pub fn remaining(&self, answered: &BTreeSet<usize>) -> Vec<&'static str> {
        self.questions
            .iter()
            .enumerate()
            .filter(|(i, _)| !answered.contains(i))
            .map(|(_, q)| q.question)
            .collect()
    }

    pub fn status(&self, answered: &BTreeSet<usize>) -> ReportStatus {
        if (0..self.questions.len()).all(|i| answered.contains(&i)) {
            ReportStatus::Complete
        } else {
            ReportStatus::Incomplete
        }
    }
}

/// Lowercase words separated by single spaces, with a space at both ends.
fn normalize(transcript: &str) -> String {
    let words = transcript
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>();
    format!(" {} ", words.split_whitespace().collect::<Vec<_>>().join(" "))
}
